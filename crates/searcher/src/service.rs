use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use shardzilla_engine::index::SnapshotHolder;
use shardzilla_engine::schema::Catalog;
use shardzilla_engine::wire::{self, ErrorBody, SearchMetrics, SearcherRequest, ShardStatus};
use shardzilla_engine::{EngineError, EngineLimits, QueryEngine, Result};

use crate::config::SearcherConfig;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub snapshots: Arc<SnapshotHolder>,
    pub sem: Arc<Semaphore>,
    pub cfg: SearcherConfig,
    pub limits: EngineLimits,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>, snapshots: Arc<SnapshotHolder>, cfg: SearcherConfig) -> Self {
        let sem = Arc::new(Semaphore::new(cfg.permits()));
        Self {
            catalog,
            snapshots,
            sem,
            cfg,
            limits: EngineLimits::default(),
        }
    }

    /// Семафор → дедлайн → движок. Частичный сбор при дедлайне выбрасывается.
    pub async fn handle(&self, req: SearcherRequest) -> Result<Vec<u8>> {
        let _permit = tokio::time::timeout(
            Duration::from_millis(self.cfg.queue_timeout_ms),
            self.sem.clone().acquire_owned(),
        )
        .await
        .map_err(|_| EngineError::Overloaded)?
        .map_err(|_| EngineError::Overloaded)?;

        if let Some(kw) = req.query.keywords.as_ref().and_then(|k| k.client_keywords.as_deref()) {
            tracing::debug!(shard = req.shard_id, client_keywords = %kw, "raw client input");
        }

        // Запрос в полёте дорабатывает на своём снапшоте, даже если пришёл рефреш.
        let snapshot = self.snapshots.acquire();
        let engine = QueryEngine::new(self.catalog.clone(), snapshot, self.limits);
        let threshold = req
            .pruning_budget
            .unwrap_or(self.limits.total_hits_threshold);

        let deadline = Duration::from_millis(req.deadline_ms.unwrap_or(self.cfg.default_deadline_ms));
        let ct = CancellationToken::new();
        let started = Instant::now();
        let hits = tokio::select! {
            r = engine.search_with_threshold(&req.query, ct.clone(), threshold) => r?,
            _ = tokio::time::sleep(deadline) => {
                ct.cancel();
                return Err(EngineError::Deadline);
            }
        };

        tracing::info!(
            shard = req.shard_id,
            namespace = %req.query.namespace,
            hits = hits.docs.len(),
            total = hits.total_matched,
            took_ms = started.elapsed().as_millis() as u64,
            "search done"
        );

        let mut payload = wire::payload_from_docs(&hits.docs, &hits);
        payload.shard_statuses = vec![ShardStatus {
            shard: req.shard_id,
            ok: true,
            error: None,
        }];
        if req.include_metrics {
            payload.metrics = Some(SearchMetrics {
                collect_ms: started.elapsed().as_millis() as u64,
                io_dropped: hits.io_dropped,
                fanout_ms: None,
                dedup_dropped: None,
            });
        }
        wire::encode(&payload, req.format)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/search", post(search))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn search(State(st): State<AppState>, Json(req): Json<SearcherRequest>) -> Response {
    match st.handle(req).await {
        Ok(bytes) => (
            StatusCode::OK,
            [("content-type", "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

pub fn error_response(e: &EngineError) -> Response {
    let status = match e {
        EngineError::InvalidQuery { .. }
        | EngineError::JoinTooLarge { .. }
        | EngineError::DepthExceeded(_)
        | EngineError::Decode(_) => StatusCode::BAD_REQUEST,
        EngineError::Deadline => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        EngineError::Overloaded => StatusCode::TOO_MANY_REQUESTS,
        EngineError::IndexUnavailable(_) | EngineError::PartialFailure { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody::of(e))).into_response()
}
