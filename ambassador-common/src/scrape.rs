//! Scrape timeout handling shared by the bridge and the responder.
//!
//! The timeout travels from the collector's header into the bus request
//! payload as a query-string key. Each leg applies it on its own; there is no
//! shared deadline across legs.

use std::fmt;
use std::time::Duration;

use url::form_urlencoded;

/// Header (and query key) carrying the collector's scrape timeout in seconds.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// Timeout applied when the header is absent or unusable.
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 10;

/// Scrape timeout in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScrapeTimeout(u64);

impl ScrapeTimeout {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Parse a raw header or query value, falling back to the default.
    ///
    /// Zero, negative, fractional and non-numeric values all fall back.
    pub fn parse(raw: Option<&str>) -> Self {
        raw.and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Self)
            .unwrap_or_default()
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for ScrapeTimeout {
    fn default() -> Self {
        Self(DEFAULT_SCRAPE_TIMEOUT_SECS)
    }
}

impl fmt::Display for ScrapeTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Build the bus request payload from an inbound query string.
///
/// Any existing timeout key is replaced so the result carries exactly one.
/// Pairs are sorted by key for a stable encoding.
///
/// # Example
/// ```
/// use ambassador_common::scrape::{ScrapeTimeout, encode_request_query};
///
/// let query = encode_request_query(Some("module=if_mib"), ScrapeTimeout::from_secs(5));
/// assert_eq!(query, "module=if_mib&x-prometheus-scrape-timeout-seconds=5");
/// ```
pub fn encode_request_query(raw_query: Option<&str>, timeout: ScrapeTimeout) -> String {
    let raw_query = raw_query.unwrap_or("");
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .filter(|(key, _)| key != SCRAPE_TIMEOUT_HEADER)
        .collect();

    pairs.push((SCRAPE_TIMEOUT_HEADER.to_string(), timeout.as_secs().to_string()));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Split a bus request payload into the scrape timeout and the remaining query.
///
/// The first timeout value wins; every occurrence of the key is removed.
pub fn decode_request_query(payload: &str) -> (ScrapeTimeout, String) {
    let mut timeout = None;
    let mut rest = Vec::new();

    for (key, value) in form_urlencoded::parse(payload.as_bytes()).into_owned() {
        if key == SCRAPE_TIMEOUT_HEADER {
            timeout.get_or_insert(value);
        } else {
            rest.push((key, value));
        }
    }

    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(rest)
        .finish();

    (ScrapeTimeout::parse(timeout.as_deref()), query)
}

/// Append a query string to a target URL.
pub fn append_query(target: &str, query: &str) -> String {
    if query.is_empty() {
        target.to_string()
    } else if target.contains('?') {
        format!("{}&{}", target, query)
    } else {
        format!("{}?{}", target, query)
    }
}
