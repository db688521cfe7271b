use thiserror::Error;

/// Ошибки ядра. Гранулярность — как их видит брокер и клиент:
/// часть фатальна для запроса, часть считается по шардам, часть — по документам.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid query at {path}: {reason}")]
    InvalidQuery { path: String, reason: String },

    #[error("join produced {got} inner results, cap is {cap}")]
    JoinTooLarge { got: usize, cap: usize },

    #[error("join nesting exceeds depth {0}")]
    DepthExceeded(usize),

    #[error("deadline exceeded")]
    Deadline,

    #[error("cancelled")]
    Cancelled,

    #[error("overloaded")]
    Overloaded,

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("io failure: {0}")]
    Io(String),

    #[error("wire decode: {0}")]
    Decode(String),

    #[error("{failed} of {total} shards failed")]
    PartialFailure { failed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidQuery {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Стабильный тег для статусов по шардам и HTTP-слоя.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidQuery { .. } => "invalid_query",
            EngineError::JoinTooLarge { .. } => "join_too_large",
            EngineError::DepthExceeded(_) => "depth_exceeded",
            EngineError::Deadline => "deadline",
            EngineError::Cancelled => "cancelled",
            EngineError::Overloaded => "overloaded",
            EngineError::IndexUnavailable(_) => "index_unavailable",
            EngineError::Io(_) => "io_failure",
            EngineError::Decode(_) => "decode",
            EngineError::PartialFailure { .. } => "partial_failure",
        }
    }

    /// Восстановление из тега (ответ searcher-а → модель брокера).
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "join_too_large" => EngineError::JoinTooLarge { got: 0, cap: 0 },
            "depth_exceeded" => EngineError::DepthExceeded(0),
            "deadline" => EngineError::Deadline,
            "cancelled" => EngineError::Cancelled,
            "overloaded" => EngineError::Overloaded,
            "index_unavailable" => EngineError::IndexUnavailable(message),
            "io_failure" => EngineError::Io(message),
            "decode" => EngineError::Decode(message),
            _ => EngineError::InvalidQuery {
                path: String::new(),
                reason: message,
            },
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Decode(e.to_string())
    }
}
