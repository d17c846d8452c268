//! Configuration for the ambassador.

use std::path::{Path, PathBuf};

use ambassador_common::config::{LoggingConfig, ZenohConfig};
use ambassador_common::subject::{
    DEFAULT_REMOTE_WRITE_SUBJECT, DEFAULT_SUBJECT_BASE, SubjectFormat, SubjectResolver,
    is_valid_subject_base,
};
use ambassador_common::subscription::{
    RouteTable, Subscription, load_subscriptions, parse_route_url,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Failed to load subscriptions: {0}")]
    Subscriptions(#[from] ambassador_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete ambassador configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmbassadorConfig {
    /// Zenoh connection settings.
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// HTTP listener settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Pull subject naming.
    #[serde(default)]
    pub subject: SubjectConfig,

    /// Remote-write ingress and relay settings.
    #[serde(default)]
    pub remote_write: RemoteWriteConfig,

    /// Internal metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Inline subscription records.
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,

    /// Additional subscription records loaded from a separate file.
    #[serde(default)]
    pub subscriptions_file: Option<PathBuf>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to listen on (default: "127.0.0.1:8181").
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8181".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Pull subject configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectConfig {
    /// Prefix prepended to every pull subject.
    #[serde(default = "default_subject_base")]
    pub base: String,

    /// Host rendering: "mod", "fwd" or "rev".
    #[serde(default)]
    pub format: SubjectFormat,
}

fn default_subject_base() -> String {
    DEFAULT_SUBJECT_BASE.to_string()
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            base: default_subject_base(),
            format: SubjectFormat::default(),
        }
    }
}

impl SubjectConfig {
    pub fn resolver(&self) -> SubjectResolver {
        SubjectResolver::new(self.base.clone(), self.format)
    }
}

/// Remote-write configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWriteConfig {
    /// Base subject payloads are published on.
    #[serde(default = "default_remote_write_subject")]
    pub subject: String,

    /// Upstream remote-write endpoint. The relay only runs when set.
    #[serde(default)]
    pub relay_url: Option<String>,
}

fn default_remote_write_subject() -> String {
    DEFAULT_REMOTE_WRITE_SUBJECT.to_string()
}

impl Default for RemoteWriteConfig {
    fn default() -> Self {
        Self {
            subject: default_remote_write_subject(),
            relay_url: None,
        }
    }
}

/// Internal metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Metric name prefix (default: "ambassador").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "ambassador".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

impl AmbassadorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AmbassadorConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.zenoh
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.http.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.http.listen
            )));
        }

        if !is_valid_subject_base(&self.subject.base) {
            return Err(ConfigError::Validation(format!(
                "Invalid subject base: '{}'",
                self.subject.base
            )));
        }

        if !is_valid_subject_base(&self.remote_write.subject) {
            return Err(ConfigError::Validation(format!(
                "Invalid remote write subject: '{}'",
                self.remote_write.subject
            )));
        }

        if let Some(url) = &self.remote_write.relay_url {
            parse_route_url(url)
                .map_err(|e| ConfigError::Validation(format!("Invalid relay_url: {}", e)))?;
        }

        if self.metrics.prefix.is_empty() {
            return Err(ConfigError::Validation(
                "metrics prefix must not be empty".to_string(),
            ));
        }

        RouteTable::from_subscriptions(&self.subscriptions)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(())
    }

    /// Build the route table from inline records plus the subscriptions file.
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let mut records = self.subscriptions.clone();

        if let Some(path) = &self.subscriptions_file {
            let loaded = load_subscriptions(path)?;
            tracing::info!(
                path = %path.display(),
                count = loaded.len(),
                "Loaded subscription file"
            );
            records.extend(loaded);
        }

        RouteTable::from_subscriptions(&records)
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }
}
