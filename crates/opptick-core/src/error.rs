use thiserror::Error;

#[derive(Debug, Error)]
pub enum OppTickError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ambiguous: {0}")]
    Ambiguous(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Delivery error: {0}")]
    Delivery(String),
}

impl OppTickError {
    /// Returns `true` when the error is likely transient and worth retrying
    /// on a later tick (notifier failures, busy database, timeouts).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Delivery(_) => true,
            Self::Storage(msg) => is_transient_message(msg),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for OppTickError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

fn is_transient_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    let patterns = [
        "database is locked",
        "database is busy",
        "timeout",
        "timed out",
        "temporarily unavailable",
        "task join error",
    ];
    patterns.iter().any(|p| msg_lower.contains(p))
}

pub type Result<T> = std::result::Result<T, OppTickError>;
