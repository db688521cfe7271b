use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use shardzilla_engine::wire::{BrokerRequest, ErrorBody};
use shardzilla_engine::EngineError;

use crate::search::Broker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/search", post(search))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn search(State(st): State<AppState>, Json(req): Json<BrokerRequest>) -> Response {
    let format = req.format;
    match st.broker.handle(req).await {
        Ok(payload) => match shardzilla_engine::wire::encode(&payload, format) {
            Ok(bytes) => (
                StatusCode::OK,
                [("content-type", "application/octet-stream")],
                bytes,
            )
                .into_response(),
            Err(e) => error_response(&e),
        },
        Err(e) => error_response(&e),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

fn error_response(e: &EngineError) -> Response {
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
