use async_trait::async_trait;

use shardzilla_engine::wire::{self, ErrorBody, SearcherRequest, WirePayload};
use shardzilla_engine::{EngineError, Result};

/// Транспорт до searcher-а одного шарда. HTTP в проде,
/// in-process реализация в тестах.
#[async_trait]
pub trait SearcherClient: Send + Sync {
    fn shard_id(&self) -> u32;
    async fn search(&self, req: &SearcherRequest) -> Result<WirePayload>;
}

pub struct HttpSearcherClient {
    shard: u32,
    base_url: String,
    http: reqwest::Client,
}

impl HttpSearcherClient {
    pub fn new(shard: u32, base_url: impl Into<String>) -> Self {
        Self {
            shard,
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SearcherClient for HttpSearcherClient {
    fn shard_id(&self) -> u32 {
        self.shard
    }

    async fn search(&self, req: &SearcherRequest) -> Result<WirePayload> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| EngineError::IndexUnavailable(format!("shard {}: {e}", self.shard)))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::IndexUnavailable(format!("shard {}: {e}", self.shard)))?;

        if !status.is_success() {
            // Тело ошибки несёт стабильный тег EngineError.
            let err = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|b| EngineError::from_kind(&b.error, b.message))
                .unwrap_or_else(|_| {
                    EngineError::IndexUnavailable(format!("shard {}: http {status}", self.shard))
                });
            return Err(err);
        }
        wire::decode(&bytes)
    }
}
