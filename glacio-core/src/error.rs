use crate::tier::TierError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlacioError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index store error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("index store corrupt: {0}")]
    IndexCorrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transient storage error (key={key}): {message}")]
    Transient { key: String, message: String },

    #[error("permanent storage error (key={key}): {message}")]
    Permanent { key: String, message: String },

    #[error("integrity error (key={key}): expected digest {expected}, got {actual}")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("policy error: {0}")]
    Policy(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GlacioError {
    /// Attach the remote key to an adapter error.
    pub fn from_tier(key: &str, error: TierError) -> Self {
        match error {
            TierError::Transient(message) => Self::Transient {
                key: key.to_string(),
                message,
            },
            TierError::Permanent(message) => Self::Permanent {
                key: key.to_string(),
                message,
            },
            TierError::NotFound(message) => Self::Permanent {
                key: key.to_string(),
                message: format!("remote object not found: {}", message),
            },
        }
    }

    /// Errors that abort a whole batch instead of a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Index(_) | Self::IndexCorrupt(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

pub type Result<T> = std::result::Result<T, GlacioError>;
