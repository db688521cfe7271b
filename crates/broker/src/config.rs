use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    pub addr: String,
    pub catalog_path: String,
    /// Базовые URL searcher-ов; индекс в списке == shard id.
    pub searchers: Vec<String>,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Сколько документов за страницей видит L2-reorder.
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
}

fn default_deadline_ms() -> u64 { 2_000 }
fn default_lookahead() -> usize { 32 }

impl BrokerConfig {
    pub fn from_env() -> Self {
        let addr = std::env::var("SZ_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".into());
        let catalog_path = std::env::var("SZ_CATALOG").unwrap_or_else(|_| "catalog.json".into());
        let searchers = std::env::var("SZ_SEARCHERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let deadline_ms = std::env::var("SZ_DEADLINE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default_deadline_ms());
        let lookahead = std::env::var("SZ_LOOKAHEAD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default_lookahead());

        Self { addr, catalog_path, searchers, deadline_ms, lookahead }
    }
}
