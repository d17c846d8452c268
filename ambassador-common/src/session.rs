//! Zenoh session setup.

use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Translate the ambassador's connection settings into a Zenoh config.
pub fn zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    config.validate()?;

    let mut zenoh_config = zenoh::Config::default();
    let set = |zenoh_config: &mut zenoh::Config, key: &str, value: String| {
        zenoh_config
            .insert_json5(key, &value)
            .map_err(|e| Error::Config(format!("Failed to set Zenoh '{}': {}", key, e)))
    };

    set(&mut zenoh_config, "mode", format!("\"{}\"", config.mode))?;

    if !config.connect.is_empty() {
        set(
            &mut zenoh_config,
            "connect/endpoints",
            serde_json::to_string(&config.connect)?,
        )?;
    }

    if !config.listen.is_empty() {
        set(
            &mut zenoh_config,
            "listen/endpoints",
            serde_json::to_string(&config.listen)?,
        )?;
    }

    Ok(zenoh_config)
}

/// Open the session every bridge, responder and relay task shares.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = zenoh_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Zenoh session open");

    Ok(session)
}
