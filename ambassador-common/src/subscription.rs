//! Subscription records and the topic → route lookup table.
//!
//! Records follow the Dapr programmatic-subscription shape:
//!
//! ```json5
//! [{
//!     pubsubname: "zenoh",
//!     topic: "io.prometheus.exporter.node1_lan.9100",
//!     route: { default: "http://localhost:9100/metrics" },
//! }]
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::load_config;
use crate::error::{Error, Result};

/// A single subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub pubsubname: String,

    /// Bus subject the responder answers on.
    pub topic: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    pub route: PubSubRoute,
}

/// Route targets for a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubRoute {
    /// Match rules are carried for compatibility but not evaluated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,

    /// URL every request on the topic is sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(rename = "match")]
    pub match_expr: String,
    pub path: String,
}

impl Subscription {
    /// Create a record with only a topic and a default route.
    pub fn new(topic: impl Into<String>, default_route: impl Into<String>) -> Self {
        Self {
            pubsubname: String::new(),
            topic: topic.into(),
            metadata: HashMap::new(),
            route: PubSubRoute {
                rules: Vec::new(),
                default: Some(default_route.into()),
            },
        }
    }
}

/// Load subscription records from a JSON or JSON5 file.
pub fn load_subscriptions(path: impl AsRef<Path>) -> Result<Vec<Subscription>> {
    load_config(path)
}

/// Target URL bound to a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRoute {
    pub subject: String,
    pub target: Url,
}

/// Read-only topic → route table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, SubscriptionRoute>,
}

impl RouteTable {
    /// Build the table from subscription records.
    ///
    /// Records without a topic, without a default route, or with a route that
    /// is not an absolute http(s) URL are rejected. Later records replace
    /// earlier ones with the same topic.
    pub fn from_subscriptions<'a, I>(subscriptions: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Subscription>,
    {
        let mut routes = HashMap::new();

        for sub in subscriptions {
            if sub.topic.is_empty() {
                return Err(Error::Subscription("record with empty topic".to_string()));
            }

            let default = sub.route.default.as_deref().ok_or_else(|| {
                Error::Subscription(format!("topic '{}' has no default route", sub.topic))
            })?;
            let target = parse_route_url(default).map_err(|reason| {
                Error::Subscription(format!("topic '{}': {}", sub.topic, reason))
            })?;

            let route = SubscriptionRoute {
                subject: sub.topic.clone(),
                target,
            };
            if routes.insert(sub.topic.clone(), route).is_some() {
                tracing::warn!(
                    topic = %sub.topic,
                    "Duplicate subscription topic, last record wins"
                );
            }
        }

        Ok(Self { routes })
    }

    pub fn get(&self, subject: &str) -> Option<&SubscriptionRoute> {
        self.routes.get(subject)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionRoute> {
        self.routes.values()
    }
}

/// Parse a URL and require an http or https scheme.
pub fn parse_route_url(raw: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme '{}' in '{}'", other, raw)),
    }
}
