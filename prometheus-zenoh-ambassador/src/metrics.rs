//! Internal request/reply counters exposed on `/metrics`.

use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels shared by both counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SubjectLabels {
    /// Bus subject the request or reply belongs to.
    pub subject: String,
    /// HTTP status code as a decimal string.
    pub code: String,
}

impl SubjectLabels {
    fn new(subject: &str, code: u16) -> Self {
        Self {
            subject: subject.to_string(),
            code: code.to_string(),
        }
    }
}

/// Registry plus the two ambassador counters.
///
/// Created once in `main` and passed to every component, so tests can build
/// isolated instances.
#[derive(Debug)]
pub struct AmbassadorMetrics {
    registry: Registry,
    requests: Family<SubjectLabels, Counter>,
    replies: Family<SubjectLabels, Counter>,
}

/// Thread-safe reference to the metrics.
pub type SharedMetrics = Arc<AmbassadorMetrics>;

impl AmbassadorMetrics {
    pub fn new(prefix: &str) -> Self {
        let mut registry = Registry::with_prefix(prefix);

        let requests = Family::<SubjectLabels, Counter>::default();
        registry.register(
            "requests",
            "Number of requests handled by the ambassador bridge",
            requests.clone(),
        );

        let replies = Family::<SubjectLabels, Counter>::default();
        registry.register(
            "replies",
            "Number of replies handled by the ambassador responder and relay",
            replies.clone(),
        );

        Self {
            registry,
            requests,
            replies,
        }
    }

    pub fn inc_request(&self, subject: &str, code: u16) {
        self.requests
            .get_or_create(&SubjectLabels::new(subject, code))
            .inc();
    }

    pub fn inc_reply(&self, subject: &str, code: u16) {
        self.replies
            .get_or_create(&SubjectLabels::new(subject, code))
            .inc();
    }

    /// Current request count; reading never creates a series.
    pub fn requests(&self, subject: &str, code: u16) -> u64 {
        read(&self.requests, subject, code)
    }

    pub fn replies(&self, subject: &str, code: u16) -> u64 {
        read(&self.replies, subject, code)
    }

    /// Render the registry in OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

fn read(family: &Family<SubjectLabels, Counter>, subject: &str, code: u16) -> u64 {
    family
        .get(&SubjectLabels::new(subject, code))
        .map(|counter| counter.get())
        .unwrap_or(0)
}

impl Default for AmbassadorMetrics {
    fn default() -> Self {
        Self::new("ambassador")
    }
}
