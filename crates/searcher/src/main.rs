use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use searcher::config::SearcherConfig;
use searcher::service::{router, AppState};
use shardzilla_engine::index::{Snapshot, SnapshotHolder};
use shardzilla_engine::schema::Catalog;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = SearcherConfig::from_env();
    let catalog = Arc::new(Catalog::load(&cfg.catalog_path)?);
    let snapshot = Snapshot::open(Path::new(&cfg.index_dir), &catalog)?;
    let snapshots = Arc::new(SnapshotHolder::new(snapshot));

    let addr: SocketAddr = cfg.addr.parse()?;
    tracing::info!(address = %addr, index_dir = %cfg.index_dir, "searcher listening");

    let app = router(AppState::new(catalog, snapshots, cfg));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
