use thiserror::Error;

/// Common error type for ambassador components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Zenoh error: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid subscription: {0}")]
    Subscription(String),
}

/// Result type alias using the ambassador's Error.
pub type Result<T> = std::result::Result<T, Error>;
