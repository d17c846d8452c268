//! Prometheus Zenoh Ambassador Common Library
//!
//! Shared building blocks for the ambassador:
//!
//! - [`subject`] - Pull and push subject derivation
//! - [`scrape`] - Scrape timeout propagation through query strings
//! - [`subscription`] - Subscription records and the route table
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - Zenoh session management
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod scrape;
pub mod session;
pub mod subject;
pub mod subscription;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, ZenohConfig, ZenohMode, load_config, parse_config};
pub use error::{Error, Result};
pub use scrape::{
    DEFAULT_SCRAPE_TIMEOUT_SECS, SCRAPE_TIMEOUT_HEADER, ScrapeTimeout, append_query,
    decode_request_query, encode_request_query,
};
pub use session::{connect, zenoh_config};
pub use subject::{
    DEFAULT_REMOTE_WRITE_SUBJECT, DEFAULT_SUBJECT_BASE, EncodingTag, SubjectError,
    SubjectFormat, SubjectResolver, encoding_from_subject, is_concrete_subject,
    push_subscription_key, tagged_subject,
};
pub use subscription::{RouteTable, Subscription, SubscriptionRoute, load_subscriptions};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
