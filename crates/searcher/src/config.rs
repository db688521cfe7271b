use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct SearcherConfig {
    pub addr: String,
    pub index_dir: String,
    pub catalog_path: String,
    #[serde(default = "default_permits_per_core")]
    pub permits_per_core: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
}

fn default_permits_per_core() -> usize { 4 }
fn default_queue_timeout_ms() -> u64 { 50 }
fn default_deadline_ms() -> u64 { 2_000 }

impl SearcherConfig {
    pub fn from_env() -> Self {
        let addr = std::env::var("SZ_ADDR").unwrap_or_else(|_| "0.0.0.0:8091".into());
        let index_dir = std::env::var("SZ_INDEX_DIR").unwrap_or_else(|_| "index".into());
        let catalog_path = std::env::var("SZ_CATALOG").unwrap_or_else(|_| "catalog.json".into());
        let permits_per_core = env_num("SZ_PERMITS_PER_CORE", default_permits_per_core());
        let queue_timeout_ms = env_num("SZ_QUEUE_TIMEOUT_MS", default_queue_timeout_ms());
        let default_deadline_ms = env_num("SZ_DEADLINE_MS", default_deadline_ms());

        Self { addr, index_dir, catalog_path, permits_per_core, queue_timeout_ms, default_deadline_ms }
    }

    /// 4 × доступный параллелизм (если не переопределили).
    pub fn permits(&self) -> usize {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        (self.permits_per_core * cores).max(1)
    }
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
