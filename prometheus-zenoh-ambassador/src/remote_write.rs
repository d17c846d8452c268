//! Push path: remote-write ingress publishes onto the bus, the relay forwards
//! bus messages to an upstream remote-write endpoint.
//!
//! The ingress accepts `snappy` and `zstd` payloads but the relay only
//! forwards `snappy`; `zstd` messages are dropped on the relay leg.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ambassador_common::subject::{
    EncodingTag, SubjectError, encoding_from_subject, push_subscription_key, tagged_subject,
};
use axum::body::Bytes;
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;
use zenoh::sample::SampleKind;

use crate::bus::{BusError, SharedBus};
use crate::metrics::SharedMetrics;

/// Content type required by remote-write 1.0.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Protocol version header and the only accepted value.
pub const REMOTE_WRITE_VERSION_HEADER: &str = "x-prometheus-remote-write-version";
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Largest payload the ingress reads.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Timeout for the upstream POST.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(60);

const BODY_EXCERPT_BYTES: usize = 512;

/// Rejections and failures of the ingress hop.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Content-Encoding must be snappy or zstd, got '{0}'")]
    ContentEncoding(String),

    #[error("Content-Type must be application/x-protobuf, got '{0}'")]
    ContentType(String),

    #[error("X-Prometheus-Remote-Write-Version must be 0.1.0, got '{0}'")]
    Version(String),

    #[error("Empty request body")]
    EmptyBody,

    #[error("Failed to publish data: {0}")]
    Publish(#[from] BusError),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        (self.status(), format!("{}\n", self)).into_response()
    }
}

fn header_value<'a>(
    headers: &'a HeaderMap,
    name: impl axum::http::header::AsHeaderName,
) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Validate the remote-write headers and return the payload encoding.
pub fn validate_headers(headers: &HeaderMap) -> Result<EncodingTag, IngestError> {
    let encoding = header_value(headers, CONTENT_ENCODING);
    let tag = match EncodingTag::parse(encoding) {
        EncodingTag::Unknown(other) => return Err(IngestError::ContentEncoding(other)),
        tag => tag,
    };

    let content_type = header_value(headers, CONTENT_TYPE);
    if content_type != PROTOBUF_CONTENT_TYPE {
        return Err(IngestError::ContentType(content_type.to_string()));
    }

    let version = header_value(headers, REMOTE_WRITE_VERSION_HEADER);
    if version != REMOTE_WRITE_VERSION {
        return Err(IngestError::Version(version.to_string()));
    }

    Ok(tag)
}

/// Accepts remote-write requests and publishes them onto the bus.
pub struct RemoteWriteIngress {
    bus: SharedBus,
    subject: String,
}

impl RemoteWriteIngress {
    pub fn new(bus: SharedBus, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    /// Validate and publish one payload, returning the subject used.
    pub async fn ingest(&self, headers: &HeaderMap, body: Bytes) -> Result<String, IngestError> {
        let tag = validate_headers(headers).inspect_err(|e| {
            warn!(error = %e, "Rejected remote write request");
        })?;

        if body.is_empty() {
            warn!("Received empty remote write body");
            return Err(IngestError::EmptyBody);
        }

        let subject = tagged_subject(&self.subject, &tag);
        debug!(%subject, bytes = body.len(), "Publishing remote write payload");

        self.bus
            .publish(&subject, body.to_vec())
            .await
            .inspect_err(|e| {
                error!(%subject, error = %e, "Failed to publish remote write payload");
            })?;

        Ok(subject)
    }

    /// Handle one request; success is acknowledged before any relay happens.
    pub async fn handle(&self, headers: &HeaderMap, body: Bytes) -> Response {
        match self.ingest(headers, body).await {
            Ok(_) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => e.into_response(),
        }
    }
}

/// Thread-safe reference to the ingress.
pub type SharedIngress = Arc<RemoteWriteIngress>;

/// Failures of the relay leg.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Subject(#[from] SubjectError),

    #[error("unsupported encoding '{0}' on relay")]
    UnsupportedEncoding(EncodingTag),

    #[error("failed to send remote write to {url}: {source}")]
    Send {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("remote write endpoint returned non-success status: {status} (body: {body})")]
    Upstream { status: StatusCode, body: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Decide which encoding a relayed message is forwarded with.
///
/// Subjects without an `encoding.<tag>` suffix come from older senders and are
/// treated as `snappy`. Only `snappy` is forwarded.
pub fn forwarding_encoding(subject: &str) -> Result<EncodingTag, RelayError> {
    let tag = match encoding_from_subject(subject)? {
        Some(tag) => tag,
        None => {
            warn!(subject, "No encoding tag on subject, assuming snappy");
            EncodingTag::Snappy
        }
    };

    match tag {
        EncodingTag::Snappy => Ok(tag),
        other => Err(RelayError::UnsupportedEncoding(other)),
    }
}

/// Forwards bus messages to an upstream remote-write endpoint.
#[derive(Clone)]
pub struct RemoteWriteRelay {
    client: reqwest::Client,
    upstream: Url,
    metrics: SharedMetrics,
}

impl RemoteWriteRelay {
    pub fn new(upstream: Url, metrics: SharedMetrics) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("prometheus-zenoh-ambassador/", env!("CARGO_PKG_VERSION")))
            .timeout(RELAY_TIMEOUT)
            .build()
            .map_err(RelayError::Client)?;

        Ok(Self {
            client,
            upstream,
            metrics,
        })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Forward one message received on `subject`.
    pub async fn relay(&self, subject: &str, payload: Vec<u8>) -> Result<StatusCode, RelayError> {
        let encoding = forwarding_encoding(subject)?;
        let start = Instant::now();
        let bytes = payload.len();

        let response = self
            .client
            .post(self.upstream.clone())
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .header(CONTENT_ENCODING, encoding.as_str())
            .header(REMOTE_WRITE_VERSION_HEADER, REMOTE_WRITE_VERSION)
            .body(payload)
            .send()
            .await
            .map_err(|source| RelayError::Send {
                url: self.upstream.to_string(),
                source,
            })?;

        let status = response.status();
        self.metrics.inc_reply(subject, status.as_u16());

        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            let body = match response.bytes().await {
                Ok(body) => excerpt(&body),
                Err(e) => {
                    warn!(
                        code = status.as_u16(),
                        error = %e,
                        "Could not read upstream response body"
                    );
                    String::new()
                }
            };
            return Err(RelayError::Upstream { status, body });
        }

        debug!(
            subject,
            bytes,
            code = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Relayed remote write payload"
        );

        Ok(status)
    }

    /// Subscribe to `base` (tagged or not) and relay every message until shutdown.
    pub async fn serve(
        self,
        session: Arc<zenoh::Session>,
        base: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let key_expr = push_subscription_key(base);
        let subscriber = session
            .declare_subscriber(key_expr.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to {}: {}", key_expr, e))?;

        info!(key_expr = %key_expr, upstream = %self.upstream, "Relaying remote write");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                sample = subscriber.recv_async() => {
                    let sample = match sample {
                        Ok(sample) => sample,
                        Err(e) => {
                            warn!(error = %e, "Relay subscriber closed");
                            break;
                        }
                    };
                    if sample.kind() == SampleKind::Delete {
                        continue;
                    }

                    let subject = sample.key_expr().as_str().to_string();
                    let payload = sample.payload().to_bytes().into_owned();
                    let relay = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay.relay(&subject, payload).await {
                            error!(%subject, error = %e, "Remote write relay failed");
                        }
                    });
                }
            }
        }

        subscriber
            .undeclare()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to undeclare subscriber: {}", e))?;

        Ok(())
    }
}

fn excerpt(body: &[u8]) -> String {
    let end = body.len().min(BODY_EXCERPT_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}
