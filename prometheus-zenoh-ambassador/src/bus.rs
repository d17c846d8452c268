//! Message bus seam.
//!
//! Handlers talk to the bus only through [`Bus`], so they can be driven by an
//! in-memory bus in tests. [`ZenohBus`] is the production implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ambassador_common::subject::is_concrete_subject;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, trace};
use zenoh::key_expr::KeyExpr;

/// Errors returned by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no responder for subject")]
    NoResponders,

    #[error("responder rejected the request: {0}")]
    Rejected(String),

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("'{0}' is not a single concrete subject")]
    InvalidSubject(String),
}

/// The narrow bus interface the handlers depend on.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Send a request and wait for the first reply, bounded by `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    /// Publish without waiting for any reply.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// True once the underlying connection can no longer be used.
    fn is_terminated(&self) -> bool;
}

/// Thread-safe reference to a bus.
pub type SharedBus = Arc<dyn Bus>;

/// [`Bus`] backed by a Zenoh session.
#[derive(Clone)]
pub struct ZenohBus {
    session: Arc<zenoh::Session>,
}

impl ZenohBus {
    pub fn new(session: Arc<zenoh::Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }
}

#[async_trait]
impl Bus for ZenohBus {
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let start = Instant::now();

        let key_expr = concrete_key_expr(subject)?;
        let replies = self
            .session
            .get(key_expr)
            .payload(payload)
            .timeout(timeout)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        // The channel closes once the query finalizes, either because every
        // matching queryable answered or because the timeout elapsed.
        while let Ok(reply) = replies.recv_async().await {
            match reply.result() {
                Ok(sample) => return Ok(sample.payload().to_bytes().into_owned()),
                Err(err) => {
                    let reason = err.payload().try_to_string().map(|s| s.into_owned());
                    return Err(BusError::Rejected(
                        reason.unwrap_or_else(|_| "unreadable error payload".to_string()),
                    ));
                }
            }
        }

        trace!(
            subject,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query finalized without reply"
        );

        if start.elapsed() >= timeout {
            Err(BusError::Timeout(timeout))
        } else {
            Err(BusError::NoResponders)
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.session
            .put(concrete_key_expr(subject)?, payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    fn is_terminated(&self) -> bool {
        self.session.is_closed()
    }
}

/// Parse `subject` as a key expression naming exactly one key.
///
/// Passing a `KeyExpr` rather than a `&str` keeps `get` from reading a `?`
/// in the subject as the start of selector parameters.
fn concrete_key_expr(subject: &str) -> Result<KeyExpr<'static>, BusError> {
    if !is_concrete_subject(subject) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    KeyExpr::try_from(subject.to_string())
        .map_err(|e| BusError::InvalidSubject(format!("{}: {}", subject, e)))
}

/// Process-level failure that a request handler cannot recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    /// The bus connection is gone; serving further requests is pointless.
    BusTerminated { subject: String, error: String },
}

impl std::fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalCondition::BusTerminated { subject, error } => write!(
                f,
                "bus connection terminated (last request on '{}' failed: {})",
                subject, error
            ),
        }
    }
}

/// Handle used by handlers to escalate a [`FatalCondition`] to the supervisor.
#[derive(Debug, Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<FatalCondition>,
}

impl FatalReporter {
    /// Create a reporter and the receiver the supervisor listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FatalCondition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, condition: FatalCondition) {
        error!(condition = %condition, "Fatal condition reported");
        // The supervisor may already be shutting down.
        let _ = self.tx.send(condition);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concrete_key_expr() {
        let key = concrete_key_expr("io.prometheus.exporter.node1_lan.9100").unwrap();
        assert_eq!(key.as_str(), "io.prometheus.exporter.node1_lan.9100");

        for subject in [
            "io.prometheus.exporter.$*.9100",
            "io.prometheus.exporter.*.9100",
            "io.prometheus.exporter.a?b.9100",
            "io.prometheus.exporter.a//b.9100",
        ] {
            assert!(matches!(
                concrete_key_expr(subject),
                Err(BusError::InvalidSubject(_))
            ));
        }
    }

    #[test]
    fn test_fatal_reporter_delivers() {
        let (reporter, mut rx) = FatalReporter::channel();
        reporter.report(FatalCondition::BusTerminated {
            subject: "a.b.80".to_string(),
            error: "closed".to_string(),
        });

        let condition = rx.try_recv().unwrap();
        assert!(condition.to_string().contains("a.b.80"));
    }

    #[test]
    fn test_fatal_reporter_survives_closed_supervisor() {
        let (reporter, rx) = FatalReporter::channel();
        drop(rx);
        reporter.report(FatalCondition::BusTerminated {
            subject: "a.b.80".to_string(),
            error: "closed".to_string(),
        });
    }
}
