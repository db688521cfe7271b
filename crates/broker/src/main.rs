use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use broker::client::{HttpSearcherClient, SearcherClient};
use broker::config::BrokerConfig;
use broker::http_api::{router, AppState};
use broker::search::Broker;
use shardzilla_engine::schema::Catalog;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = BrokerConfig::from_env();
    let catalog = Arc::new(Catalog::load(&cfg.catalog_path)?);

    let clients: Vec<Arc<dyn SearcherClient>> = cfg
        .searchers
        .iter()
        .enumerate()
        .map(|(shard, url)| {
            Arc::new(HttpSearcherClient::new(shard as u32, url.clone())) as Arc<dyn SearcherClient>
        })
        .collect();
    anyhow::ensure!(
        clients.len() == catalog.sharding.shards as usize,
        "SZ_SEARCHERS lists {} urls, catalog expects {} shards",
        clients.len(),
        catalog.sharding.shards
    );

    let addr: SocketAddr = cfg.addr.parse()?;
    tracing::info!(address = %addr, shards = clients.len(), "broker listening");

    let broker = Arc::new(Broker::new(catalog, clients, cfg));
    let app = router(AppState { broker });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
