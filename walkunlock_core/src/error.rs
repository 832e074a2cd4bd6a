//! Error types for the walkunlock_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for walkunlock_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key-value store error
    #[error("Store error: {0}")]
    Store(String),

    /// A step delta of zero was offered to the ledger
    #[error("Step delta must be positive")]
    InvalidStepDelta,

    /// Adding steps would overflow the total counter
    #[error("Step total overflow: {total} + {delta}")]
    StepOverflow { total: u64, delta: u64 },

    /// The enforcer task is no longer running
    #[error("Enforcer stopped")]
    EnforcerStopped,

    /// Generic error
    #[error("{0}")]
    Other(String),
}
