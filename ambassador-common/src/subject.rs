//! Subject naming for the pull and push paths.
//!
//! Pull subjects follow `<base><rendered host>.<port>`, where the host is
//! lower-cased and rendered according to a [`SubjectFormat`]. Push subjects
//! follow `<base>.encoding.<tag>`.
//!
//! Zenoh only treats `/` as a chunk separator, so every subject produced here
//! is a single-chunk key expression and can be used verbatim on the bus.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default prefix for pull subjects.
pub const DEFAULT_SUBJECT_BASE: &str = "io.prometheus.exporter.";

/// Default base subject for remote-write payloads.
pub const DEFAULT_REMOTE_WRITE_SUBJECT: &str = "io.prometheus.remotewrite";

/// Port used when the host identity carries none.
pub const DEFAULT_PORT: &str = "80";

/// Segment that precedes the encoding tag on push subjects.
pub const ENCODING_SEGMENT: &str = "encoding";

/// Characters with wildcard or reserved meaning in Zenoh key expressions.
const RESERVED_CHARS: [char; 4] = ['*', '$', '?', '#'];

/// Errors raised while deriving or decoding a subject.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("malformed address '{input}': {reason}")]
    MalformedAddress { input: String, reason: &'static str },

    #[error("subject '{0}' has fewer than two segments")]
    TooFewSegments(String),

    #[error("unknown subject format '{0}', expected 'mod', 'fwd' or 'rev'")]
    UnknownFormat(String),
}

/// How host labels are rendered inside a pull subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectFormat {
    /// Labels joined with `_` into a single subject level.
    #[default]
    Mod,
    /// Labels kept in order, joined with `.`.
    Fwd,
    /// Labels reversed (top-level domain first), joined with `.`.
    Rev,
}

impl SubjectFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectFormat::Mod => "mod",
            SubjectFormat::Fwd => "fwd",
            SubjectFormat::Rev => "rev",
        }
    }

    /// Render an already lower-cased host name.
    pub fn render_host(&self, host: &str) -> String {
        let labels = host.split('.');
        match self {
            SubjectFormat::Mod => labels.collect::<Vec<_>>().join("_"),
            SubjectFormat::Fwd => labels.collect::<Vec<_>>().join("."),
            SubjectFormat::Rev => labels.rev().collect::<Vec<_>>().join("."),
        }
    }
}

impl fmt::Display for SubjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectFormat {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mod" => Ok(SubjectFormat::Mod),
            "fwd" => Ok(SubjectFormat::Fwd),
            "rev" => Ok(SubjectFormat::Rev),
            other => Err(SubjectError::UnknownFormat(other.to_string())),
        }
    }
}

/// Split `host:port` into its parts.
///
/// Mirrors the usual `host:port` / `[v6]:port` grammar. An input without any
/// port yields the whole input as host (brackets stripped) and an empty port.
pub fn split_host_port(input: &str) -> Result<(&str, &str), SubjectError> {
    let malformed = |reason| SubjectError::MalformedAddress {
        input: input.to_string(),
        reason,
    };

    if let Some(rest) = input.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| malformed("missing ']'"))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];

        if host.contains('[') {
            return Err(malformed("unexpected '['"));
        }

        return match after.strip_prefix(':') {
            _ if after.is_empty() => Ok((host, "")),
            Some(port) if !port.contains([':', '[', ']']) => Ok((host, port)),
            Some(_) => Err(malformed("too many colons")),
            None => Err(malformed("unexpected data after ']'")),
        };
    }

    let Some(colon) = input.rfind(':') else {
        return Ok((input, ""));
    };

    let (host, port) = (&input[..colon], &input[colon + 1..]);
    if host.contains(':') {
        return Err(malformed("too many colons"));
    }
    if input.contains(['[', ']']) {
        return Err(malformed("unexpected bracket"));
    }

    Ok((host, port))
}

/// Derives pull subjects from externally supplied host identities.
///
/// Built once from configuration and shared read-only by every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectResolver {
    base: String,
    format: SubjectFormat,
}

impl SubjectResolver {
    pub fn new(base: impl Into<String>, format: SubjectFormat) -> Self {
        Self {
            base: base.into(),
            format,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn format(&self) -> SubjectFormat {
        self.format
    }

    /// Resolve a `host[:port]` identity to a subject.
    ///
    /// # Example
    /// ```
    /// use ambassador_common::subject::{SubjectFormat, SubjectResolver};
    ///
    /// let resolver = SubjectResolver::new("io.prometheus.exporter.", SubjectFormat::Rev);
    /// let subject = resolver.resolve("Target1.Example.com:9100").unwrap();
    /// assert_eq!(subject, "io.prometheus.exporter.com.example.target1.9100");
    /// ```
    pub fn resolve(&self, host_port: &str) -> Result<String, SubjectError> {
        let normalized = host_port.to_lowercase();
        let (host, port) = split_host_port(&normalized)?;
        let port = if port.is_empty() { DEFAULT_PORT } else { port };

        Ok(format!(
            "{}{}.{}",
            self.base,
            self.format.render_host(host),
            port
        ))
    }
}

impl Default for SubjectResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT_BASE, SubjectFormat::default())
    }
}

/// Content encoding carried in the trailing segments of a push subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncodingTag {
    Snappy,
    Zstd,
    Unknown(String),
}

impl EncodingTag {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "snappy" => EncodingTag::Snappy,
            "zstd" => EncodingTag::Zstd,
            other => EncodingTag::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EncodingTag::Snappy => "snappy",
            EncodingTag::Zstd => "zstd",
            EncodingTag::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for EncodingTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the push subject for a payload with the given encoding.
///
/// # Example
/// ```
/// use ambassador_common::subject::{EncodingTag, tagged_subject};
///
/// let subject = tagged_subject("io.prometheus.remotewrite", &EncodingTag::Snappy);
/// assert_eq!(subject, "io.prometheus.remotewrite.encoding.snappy");
/// ```
pub fn tagged_subject(base: &str, tag: &EncodingTag) -> String {
    format!("{}.{}.{}", base, ENCODING_SEGMENT, tag)
}

/// Extract the encoding tag from a push subject.
///
/// Returns `Ok(None)` when the last two segments are not `encoding.<tag>`.
pub fn encoding_from_subject(subject: &str) -> Result<Option<EncodingTag>, SubjectError> {
    let segments: Vec<&str> = subject.split('.').collect();
    if segments.len() < 2 {
        return Err(SubjectError::TooFewSegments(subject.to_string()));
    }

    match &segments[segments.len() - 2..] {
        [ENCODING_SEGMENT, tag] => Ok(Some(EncodingTag::parse(tag))),
        _ => Ok(None),
    }
}

/// Key expression matching a push base subject with or without an encoding suffix.
///
/// # Example
/// ```
/// use ambassador_common::subject::push_subscription_key;
///
/// assert_eq!(
///     push_subscription_key("io.prometheus.remotewrite"),
///     "io.prometheus.remotewrite$*"
/// );
/// ```
pub fn push_subscription_key(base: &str) -> String {
    format!("{}$*", base)
}

/// True when `subject` names exactly one key, so a request on it can only
/// reach the responder bound to that subject.
///
/// Host identities come from request headers; one carrying `*` or `$*` would
/// otherwise fan a single scrape out to every matching responder.
pub fn is_concrete_subject(subject: &str) -> bool {
    !subject.is_empty()
        && !subject.contains(RESERVED_CHARS)
        && !subject.split('/').any(str::is_empty)
}

/// Check that a configured subject prefix is usable as a key expression prefix.
pub fn is_valid_subject_base(base: &str) -> bool {
    !base.is_empty() && !base.contains(RESERVED_CHARS)
}
