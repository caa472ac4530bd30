//! Newtype wrappers for pipeline identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds (e.g.,
//! using a raw stream key where a job id is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque job correlation key, stable for a pipeline's lifetime.
///
/// Producers assign these (typically UUIDs); this subsystem only hashes and
/// compares them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(s: impl Into<String>) -> Self {
        JobId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is missing (empty string after decode).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// A service domain (e.g., `scan`, `chat`).
///
/// The domain selects the stream-key namespace (`{domain}:events:{shard}`)
/// and the state-key prefix (`{domain}:state:{job_id}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(pub String);

impl Domain {
    pub fn new(s: impl Into<String>) -> Self {
        Domain(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the domain from a partition stream key.
    ///
    /// Stream keys look like `scan:events:3`; the domain is the first
    /// colon-separated segment.
    pub fn of_stream_key(stream_key: &str) -> Domain {
        Domain(
            stream_key
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string(),
        )
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Domain(s.to_string())
    }
}

/// A delivery-order identifier assigned by the durable log.
///
/// Redis stream id format: `{timestamp_ms}-{seq}` (e.g. `1737415902456-0`).
/// Unlike a producer-assigned `seq`, positions are monotonic within a
/// partition, which makes them safe as client-visible cursors. Comparison is
/// lexicographic on the `(ms, seq)` pair.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(from = "String", into = "String")]
pub struct StreamPosition {
    pub ms: u64,
    pub seq: u64,
}

impl StreamPosition {
    pub fn new(ms: u64, seq: u64) -> Self {
        StreamPosition { ms, seq }
    }

    /// Parses a stream id, falling back to `0-0` on malformed input.
    ///
    /// The log backend is the only writer of these ids, so a malformed value
    /// means a caller-supplied cursor (e.g. a bogus `Last-Event-ID` header);
    /// treating it as the epoch start is the safe degradation.
    pub fn parse_lossy(s: &str) -> Self {
        let mut parts = s.splitn(2, '-');
        let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        StreamPosition { ms, seq }
    }

    /// Returns true if this is the zero cursor (nothing seen yet).
    pub fn is_origin(&self) -> bool {
        self.ms == 0 && self.seq == 0
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl From<String> for StreamPosition {
    fn from(s: String) -> Self {
        StreamPosition::parse_lossy(&s)
    }
}

impl From<StreamPosition> for String {
    fn from(p: StreamPosition) -> Self {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_position_parses_redis_ids() {
        let p = StreamPosition::parse_lossy("1737415902456-3");
        assert_eq!(p.ms, 1737415902456);
        assert_eq!(p.seq, 3);
        assert_eq!(p.to_string(), "1737415902456-3");
    }

    #[test]
    fn stream_position_malformed_is_origin() {
        assert!(StreamPosition::parse_lossy("garbage").is_origin());
        assert!(StreamPosition::parse_lossy("").is_origin());
        // Partial ids keep what parsed.
        assert_eq!(StreamPosition::parse_lossy("5-x"), StreamPosition::new(5, 0));
    }

    #[test]
    fn stream_position_orders_by_ms_then_seq() {
        let a = StreamPosition::new(100, 9);
        let b = StreamPosition::new(101, 0);
        let c = StreamPosition::new(101, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn domain_from_stream_key() {
        assert_eq!(Domain::of_stream_key("scan:events:2"), Domain::new("scan"));
        assert_eq!(Domain::of_stream_key("chat:events:0"), Domain::new("chat"));
    }
}
