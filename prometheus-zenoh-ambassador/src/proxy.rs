//! Pull path: HTTP scrape in, bus request out.

use std::sync::Arc;
use std::time::Instant;

use ambassador_common::scrape::{SCRAPE_TIMEOUT_HEADER, ScrapeTimeout, encode_request_query};
use ambassador_common::subject::{SubjectError, SubjectResolver, is_concrete_subject};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{BusError, FatalCondition, FatalReporter, SharedBus};
use crate::metrics::SharedMetrics;

/// Header set by reverse proxies and by Prometheus relabelling setups.
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

const MISSING_HOST_BODY: &str = r#"<html>
<head><title>Prometheus Zenoh Ambassador</title></head>
<body><b>ERROR: missing Host parameter</b></body>
</html>
"#;

/// Request-local failures of the pull path.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no target host in request")]
    MissingHost,

    #[error(transparent)]
    InvalidHost(#[from] SubjectError),

    #[error("request on '{subject}' failed: {source}")]
    Bus {
        subject: String,
        #[source]
        source: BusError,
    },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingHost | ProxyError::InvalidHost(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Bus { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ProxyError::MissingHost => {
                (status, [(CONTENT_TYPE, "text/html")], MISSING_HOST_BODY).into_response()
            }
            other => (status, format!("{}\n", other)).into_response(),
        }
    }
}

/// Bridges inbound scrapes onto bus requests.
pub struct ScrapeProxy {
    bus: SharedBus,
    resolver: SubjectResolver,
    metrics: SharedMetrics,
    fatal: FatalReporter,
}

impl ScrapeProxy {
    pub fn new(
        bus: SharedBus,
        resolver: SubjectResolver,
        metrics: SharedMetrics,
        fatal: FatalReporter,
    ) -> Self {
        Self {
            bus,
            resolver,
            metrics,
            fatal,
        }
    }

    /// Forward one scrape and return the exporter's body.
    pub async fn scrape(&self, headers: &HeaderMap, uri: &Uri) -> Result<Vec<u8>, ProxyError> {
        let start = Instant::now();

        let host = target_host(headers, uri).ok_or(ProxyError::MissingHost)?;
        let timeout = ScrapeTimeout::parse(header_str(headers, SCRAPE_TIMEOUT_HEADER));
        let subject = self.resolver.resolve(&host)?;

        if !is_concrete_subject(&subject) {
            self.metrics
                .inc_request(&subject, StatusCode::SERVICE_UNAVAILABLE.as_u16());
            warn!(%subject, %host, "Refusing scrape for a wildcard or reserved subject");
            return Err(ProxyError::Bus {
                source: BusError::InvalidSubject(subject.clone()),
                subject,
            });
        }

        let payload = encode_request_query(uri.query(), timeout);

        debug!(%subject, %host, %timeout, "Forwarding scrape");

        match self
            .bus
            .request(&subject, payload.into_bytes(), timeout.as_duration())
            .await
        {
            Ok(body) => {
                self.metrics.inc_request(&subject, StatusCode::OK.as_u16());
                debug!(
                    %subject,
                    bytes = body.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Scrape succeeded"
                );
                Ok(body)
            }
            Err(source) => {
                self.metrics
                    .inc_request(&subject, StatusCode::SERVICE_UNAVAILABLE.as_u16());
                warn!(
                    %subject,
                    error = %source,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Scrape failed"
                );

                if self.bus.is_terminated() {
                    self.fatal.report(FatalCondition::BusTerminated {
                        subject: subject.clone(),
                        error: source.to_string(),
                    });
                }

                Err(ProxyError::Bus { subject, source })
            }
        }
    }

    /// Forward one scrape and build the HTTP response.
    pub async fn handle(&self, headers: &HeaderMap, uri: &Uri) -> Response {
        match self.scrape(headers, uri).await {
            Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], body).into_response(),
            Err(e) => e.into_response(),
        }
    }
}

/// Thread-safe reference to the proxy.
pub type SharedProxy = Arc<ScrapeProxy>;

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl axum::http::header::AsHeaderName,
) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Host identity of the scrape target.
///
/// Prefers the first `X-Forwarded-Host` entry, then `Host`, then the
/// request URI authority.
fn target_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    header_str(headers, FORWARDED_HOST_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, HOST))
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::MockBus;
    use crate::metrics::AmbassadorMetrics;
    use axum::http::HeaderValue;
    use std::time::Duration;

    type FatalRx = tokio::sync::mpsc::UnboundedReceiver<FatalCondition>;

    fn make_proxy(bus: Arc<MockBus>) -> (ScrapeProxy, SharedMetrics, FatalRx) {
        let metrics = Arc::new(AmbassadorMetrics::default());
        let (fatal, rx) = FatalReporter::channel();
        let proxy = ScrapeProxy::new(bus, SubjectResolver::default(), metrics.clone(), fatal);
        (proxy, metrics, rx)
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[tokio::test]
    async fn test_scrape_success() {
        let bus = MockBus::replying(b"node_up 1\n");
        let (proxy, metrics, _rx) = make_proxy(bus.clone());
        let uri: Uri = "/proxy?module=if_mib".parse().unwrap();

        let body = proxy
            .scrape(
                &headers(&[
                    ("host", "Node1.LAN:9100"),
                    ("x-prometheus-scrape-timeout-seconds", "7"),
                ]),
                &uri,
            )
            .await
            .unwrap();

        assert_eq!(body, b"node_up 1\n");
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "io.prometheus.exporter.node1_lan.9100");
        assert_eq!(
            sent[0].payload,
            b"module=if_mib&x-prometheus-scrape-timeout-seconds=7"
        );
        assert_eq!(sent[0].timeout, Some(Duration::from_secs(7)));
        assert_eq!(metrics.requests("io.prometheus.exporter.node1_lan.9100", 200), 1);
    }

    #[tokio::test]
    async fn test_forwarded_host_wins() {
        let bus = MockBus::replying(b"");
        let (proxy, _, _rx) = make_proxy(bus.clone());
        let uri: Uri = "/proxy".parse().unwrap();

        proxy
            .scrape(
                &headers(&[
                    ("host", "ambassador:8181"),
                    ("x-forwarded-host", "exporter.lan:9100, edge:80"),
                ]),
                &uri,
            )
            .await
            .unwrap();

        assert_eq!(bus.sent()[0].subject, "io.prometheus.exporter.exporter_lan.9100");
        assert_eq!(bus.sent()[0].timeout, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_gateway_without_bus() {
        let bus = MockBus::replying(b"");
        let (proxy, _, _rx) = make_proxy(bus.clone());
        let uri: Uri = "/proxy".parse().unwrap();

        let err = proxy.scrape(&HeaderMap::new(), &uri).await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingHost));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err = proxy
            .scrape(&headers(&[("host", ""), ("x-forwarded-host", "  ")]), &uri)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MissingHost));
        assert!(bus.sent().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_host_is_bad_gateway() {
        let bus = MockBus::replying(b"");
        let (proxy, _, _rx) = make_proxy(bus.clone());
        let uri: Uri = "/proxy".parse().unwrap();

        let err = proxy
            .scrape(&headers(&[("host", "fe80::1:9100")]), &uri)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(bus.sent().is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_host_never_reaches_bus() {
        let bus = MockBus::replying(b"from every exporter");
        let (proxy, metrics, mut rx) = make_proxy(bus.clone());
        let uri: Uri = "/proxy".parse().unwrap();

        for host in ["$*:9100", "*:9100", "node1.lan:*", "a?b=c:9100", "a#b:9100"] {
            let response = proxy
                .handle(&headers(&[("x-forwarded-host", host)]), &uri)
                .await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{host}");
        }

        assert!(bus.sent().is_empty());
        assert_eq!(metrics.requests("io.prometheus.exporter.$*.9100", 503), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bus_failure_is_unavailable() {
        let bus = MockBus::failing(BusError::Timeout(Duration::from_secs(10)));
        let (proxy, metrics, mut rx) = make_proxy(bus.clone());
        let uri: Uri = "/proxy".parse().unwrap();

        let response = proxy.handle(&headers(&[("host", "a.lan:9100")]), &uri).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(bus.sent().len(), 1, "no retry");
        assert_eq!(metrics.requests("io.prometheus.exporter.a_lan.9100", 503), 1);
        assert!(rx.try_recv().is_err(), "timeouts are request-local");
    }

    #[tokio::test]
    async fn test_terminated_bus_reports_fatal() {
        let bus = MockBus::failing(BusError::Transport("session closed".to_string()));
        *bus.terminated.lock() = true;
        let (proxy, _, mut rx) = make_proxy(bus);
        let uri: Uri = "/proxy".parse().unwrap();

        let response = proxy.handle(&headers(&[("host", "a.lan:9100")]), &uri).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            rx.try_recv().unwrap(),
            FatalCondition::BusTerminated { .. }
        ));
    }
}
