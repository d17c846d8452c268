//! Exporter side of the pull path: bus request in, local HTTP scrape out.

use std::sync::Arc;
use std::time::Instant;

use ambassador_common::scrape::{append_query, decode_request_query};
use ambassador_common::subscription::{RouteTable, SubscriptionRoute};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::metrics::SharedMetrics;

/// Failures while answering a bus request.
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("400 Bad Request: no subject")]
    EmptySubject,

    #[error("failed to scrape {url}: {source}")]
    Scrape {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Turns bus requests into scrapes of local exporters.
#[derive(Clone)]
pub struct ExporterResponder {
    client: reqwest::Client,
    metrics: SharedMetrics,
}

impl ExporterResponder {
    pub fn new(metrics: SharedMetrics) -> Result<Self, ResponderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("prometheus-zenoh-ambassador/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ResponderError::Client)?;

        Ok(Self { client, metrics })
    }

    /// Scrape `target` for a request received on `subject`.
    ///
    /// `payload` is the query string built by the bridge. Its scrape timeout
    /// bounds the outbound request; the remaining pairs are forwarded.
    pub async fn respond(
        &self,
        subject: &str,
        target: &Url,
        payload: &str,
    ) -> Result<Vec<u8>, ResponderError> {
        if subject.is_empty() {
            self.metrics.inc_reply(subject, 400);
            return Err(ResponderError::EmptySubject);
        }

        let start = Instant::now();
        let (timeout, query) = decode_request_query(payload);
        let url = append_query(target.as_str(), &query);

        debug!(subject, %url, %timeout, "Scraping exporter");

        let response = self
            .client
            .get(&url)
            .header(CONTENT_TYPE, "text/plain")
            .timeout(timeout.as_duration())
            .send()
            .await
            .map_err(|source| ResponderError::Scrape {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| ResponderError::Body {
                url: url.clone(),
                source,
            })?;

        // Counted as 200 whatever the exporter returned.
        self.metrics.inc_reply(subject, StatusCode::OK.as_u16());
        debug!(
            subject,
            code = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Exporter scraped"
        );

        Ok(body.to_vec())
    }

    /// Serve every route in `routes` on the Zenoh session until shutdown.
    pub async fn serve(
        self,
        session: Arc<zenoh::Session>,
        routes: Arc<RouteTable>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();

        for route in routes.iter() {
            let queryable = session
                .declare_queryable(route.subject.as_str())
                .await
                .map_err(|e| {
                    anyhow::anyhow!("Failed to declare queryable on {}: {}", route.subject, e)
                })?;

            info!(subject = %route.subject, target = %route.target, "Subscribed");

            tasks.spawn(self.clone().serve_route(
                queryable,
                route.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Responder task failed");
            }
        }

        Ok(())
    }

    async fn serve_route(
        self,
        queryable: zenoh::query::Queryable<
            zenoh::handlers::FifoChannelHandler<zenoh::query::Query>,
        >,
        route: SubscriptionRoute,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let route = Arc::new(route);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                query = queryable.recv_async() => {
                    let query = match query {
                        Ok(query) => query,
                        Err(e) => {
                            warn!(subject = %route.subject, error = %e, "Queryable closed");
                            break;
                        }
                    };

                    // One worker per request; slow exporters never block the loop.
                    let responder = self.clone();
                    let route = route.clone();
                    tokio::spawn(async move {
                        responder.answer(query, &route).await;
                    });
                }
            }
        }

        if let Err(e) = queryable.undeclare().await {
            warn!(subject = %route.subject, error = %e, "Failed to undeclare queryable");
        }
    }

    async fn answer(&self, query: zenoh::query::Query, route: &SubscriptionRoute) {
        let payload = query
            .payload()
            .and_then(|p| p.try_to_string().ok().map(|s| s.into_owned()))
            .unwrap_or_default();

        // Counted and answered on the bound subject, whatever key the query used.
        let subject = route.subject.as_str();
        if query.key_expr().as_str() != subject {
            debug!(subject, query = %query.key_expr(), "Answering query on bound subject");
        }

        let sent = match self.respond(subject, &route.target, &payload).await {
            Ok(body) => query.reply(subject, body).await,
            Err(e) => {
                warn!(%subject, error = %e, "Scrape failed, replying with error");
                query.reply_err(e.to_string()).await
            }
        };

        if let Err(e) = sent {
            warn!(%subject, error = %e, "Failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AmbassadorMetrics;
    use axum::Router;
    use axum::extract::RawQuery;
    use axum::routing::get;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn spawn_exporter(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }

    fn make_responder() -> (ExporterResponder, SharedMetrics) {
        let metrics = Arc::new(AmbassadorMetrics::default());
        (ExporterResponder::new(metrics.clone()).unwrap(), metrics)
    }

    #[tokio::test]
    async fn test_respond_forwards_query_without_timeout() {
        let router = Router::new().route(
            "/probe",
            get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
        );
        let addr = spawn_exporter(router).await;
        let target = Url::parse(&format!("http://{}/probe", addr)).unwrap();
        let (responder, metrics) = make_responder();

        let body = responder
            .respond(
                "io.prometheus.exporter.a.9115",
                &target,
                "module=http_2xx&x-prometheus-scrape-timeout-seconds=5",
            )
            .await
            .unwrap();

        assert_eq!(body, b"module=http_2xx");
        assert_eq!(metrics.replies("io.prometheus.exporter.a.9115", 200), 1);
    }

    #[tokio::test]
    async fn test_respond_relays_exporter_error_status() {
        let router = Router::new().route(
            "/metrics",
            get(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "collector failed",
                )
            }),
        );
        let addr = spawn_exporter(router).await;
        let target = Url::parse(&format!("http://{}/metrics", addr)).unwrap();
        let (responder, metrics) = make_responder();
        let subject = "io.prometheus.exporter.b.9100";

        let body = responder.respond(subject, &target, "").await.unwrap();

        assert_eq!(body, b"collector failed");
        assert_eq!(metrics.replies(subject, 200), 1);
        assert_eq!(metrics.replies(subject, 500), 0);
    }

    #[tokio::test]
    async fn test_respond_applies_scrape_timeout() {
        let router = Router::new().route(
            "/metrics",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );
        let addr = spawn_exporter(router).await;
        let target = Url::parse(&format!("http://{}/metrics", addr)).unwrap();
        let (responder, metrics) = make_responder();

        let start = Instant::now();
        let err = responder
            .respond(
                "io.prometheus.exporter.a.9100",
                &target,
                "x-prometheus-scrape-timeout-seconds=1",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ResponderError::Scrape { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(metrics.replies("io.prometheus.exporter.a.9100", 200), 0);
    }

    #[tokio::test]
    async fn test_respond_empty_subject() {
        let (responder, metrics) = make_responder();
        let target = Url::parse("http://127.0.0.1:1/metrics").unwrap();

        let err = responder.respond("", &target, "").await.unwrap_err();
        assert!(matches!(err, ResponderError::EmptySubject));
        assert_eq!(metrics.replies("", 400), 1);
    }

    #[tokio::test]
    async fn test_respond_unreachable_exporter() {
        let (responder, _) = make_responder();
        // Bind and drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target = Url::parse(&format!("http://{}/metrics", addr)).unwrap();

        let err = responder
            .respond("io.prometheus.exporter.a.9100", &target, "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to scrape"));
    }

    /// A wildcard query is counted and answered under the bound subject.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wildcard_query_uses_bound_subject() {
        use std::time::{SystemTime, UNIX_EPOCH};

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let subject = format!("test_{}.node1_lan.9100", nanos);
        let wildcard = format!("test_{}.*.9100", nanos);

        let router = Router::new().route("/metrics", get(|| async { "up 1\n" }));
        let addr = spawn_exporter(router).await;
        let routes = RouteTable::from_subscriptions(&[
            ambassador_common::subscription::Subscription::new(
                subject.clone(),
                format!("http://{}/metrics", addr),
            ),
        ])
        .unwrap();

        let session = Arc::new(zenoh::open(zenoh::Config::default()).await.unwrap());
        let (responder, metrics) = make_responder();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(responder.serve(session.clone(), Arc::new(routes), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;

        let replies = session
            .get(wildcard.as_str())
            .timeout(Duration::from_secs(5))
            .await
            .unwrap();
        let reply = replies.recv_async().await.unwrap();
        let sample = reply.result().unwrap();

        assert_eq!(sample.key_expr().as_str(), subject);
        assert_eq!(sample.payload().to_bytes().as_ref(), b"up 1\n");
        assert_eq!(metrics.replies(&subject, 200), 1);
        assert_eq!(metrics.replies(&wildcard, 200), 0);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        session.close().await.unwrap();
    }
}
