//! The wire-level event flowing through the pipeline.
//!
//! Upstream workers append flat string-keyed field maps to the durable log;
//! the router re-publishes the same event as JSON on the fan-out channel and
//! stores the latest applied event per job as the state snapshot. This module
//! owns both decodings.
//!
//! Decoding is deliberately lenient: at-least-once delivery means the
//! pipeline must absorb whatever a producer managed to write. A field that
//! fails to parse is kept as raw text rather than discarding the whole event,
//! since downstream consumers may not need that field.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::ids::{JobId, StreamPosition};

/// Stage name carried by token-delta events (the high-frequency sub-stream).
pub const STAGE_TOKEN: &str = "token";

/// Stage name of the terminal success marker.
pub const STAGE_DONE: &str = "done";

/// Status value of the terminal failure marker.
pub const STATUS_FAILED: &str = "failed";

/// A single pipeline progress event.
///
/// `seq` is assigned by the producer and is monotonically increasing per job
/// (but at-least-once delivery can reorder, duplicate, or gap it on the
/// wire). `log_position` is assigned by the durable log on append and is the
/// client-visible cursor; it is `None` for synthetic events that never went
/// through the log (keepalive-adjacent snapshots, token recovery).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    #[serde(default)]
    pub job_id: JobId,

    #[serde(default)]
    pub stage: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub seq: i64,

    #[serde(
        default,
        deserialize_with = "lenient_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<i64>,

    /// Producer payload, opaque to this subsystem. JSON-decoded when
    /// possible, raw text otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Producer wall-clock timestamp (epoch seconds). Informational only;
    /// never used for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,

    /// Delivery-order id assigned by the log, serialized as `stream_id` for
    /// compatibility with the SSE `id:` field convention.
    #[serde(
        rename = "stream_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub log_position: Option<StreamPosition>,

    /// Producer-specific extras (e.g. `content`/`node` on token events).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StageEvent {
    /// Creates an event with the given core fields (mostly for tests and
    /// synthetic gateway events).
    pub fn new(job_id: impl Into<JobId>, stage: &str, status: &str, seq: i64) -> Self {
        StageEvent {
            job_id: job_id.into(),
            stage: stage.to_string(),
            status: status.to_string(),
            seq,
            ..StageEvent::default()
        }
    }

    /// Decodes an event from the flat string map stored in a log entry.
    ///
    /// Normalization rules (tolerant by design):
    /// - `seq` / `progress` are integer-coerced; unparsable values fall back
    ///   to 0 / absent
    /// - `result` is best-effort JSON-decoded; on failure the raw text is
    ///   kept as a JSON string
    /// - a missing `job_id` falls back to the producer's `task_id` alias
    /// - a missing `stage` falls back to `event_type` (token producers write
    ///   the latter)
    /// - everything else lands in `extra` untouched
    pub fn from_stream_fields(fields: &HashMap<String, String>) -> StageEvent {
        let mut event = StageEvent::default();

        for (key, value) in fields {
            match key.as_str() {
                "job_id" => event.job_id = JobId::new(value.clone()),
                "task_id" => {
                    if event.job_id.is_empty() {
                        event.job_id = JobId::new(value.clone());
                    }
                }
                "stage" => event.stage = value.clone(),
                "event_type" => {
                    if event.stage.is_empty() {
                        event.stage = value.clone();
                    } else {
                        event
                            .extra
                            .insert(key.clone(), Value::String(value.clone()));
                    }
                }
                "status" => event.status = value.clone(),
                "seq" => event.seq = value.parse().unwrap_or(0),
                "progress" => event.progress = value.parse().ok(),
                "ts" | "timestamp" => event.ts = value.parse().ok(),
                "result" => {
                    if !value.is_empty() {
                        event.result = Some(
                            serde_json::from_str(value)
                                .unwrap_or_else(|_| Value::String(value.clone())),
                        );
                    }
                }
                _ => {
                    event
                        .extra
                        .insert(key.clone(), Value::String(value.clone()));
                }
            }
        }

        event
    }

    /// True for the high-frequency token-delta sub-stream.
    pub fn is_token(&self) -> bool {
        self.stage == STAGE_TOKEN
    }

    /// True for events that finish a job's pipeline and close client streams.
    pub fn is_terminal(&self) -> bool {
        self.stage == STAGE_DONE || self.status == STATUS_FAILED
    }
}

/// Accepts a JSON number or a numeric string; anything else decodes to 0.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(coerce_i64(Value::deserialize(deserializer)?).unwrap_or(0))
}

fn lenient_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(coerce_i64(Value::deserialize(deserializer)?))
}

fn coerce_i64(value: Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_core_fields_from_stream_entry() {
        let event = StageEvent::from_stream_fields(&fields(&[
            ("job_id", "j-1"),
            ("stage", "vision"),
            ("status", "completed"),
            ("seq", "3"),
            ("progress", "60"),
            ("result", r#"{"label":"plastic"}"#),
        ]));

        assert_eq!(event.job_id.as_str(), "j-1");
        assert_eq!(event.stage, "vision");
        assert_eq!(event.seq, 3);
        assert_eq!(event.progress, Some(60));
        assert_eq!(event.result.unwrap()["label"], "plastic");
    }

    #[test]
    fn malformed_result_is_kept_as_raw_text() {
        let event = StageEvent::from_stream_fields(&fields(&[
            ("job_id", "j-1"),
            ("seq", "1"),
            ("result", "not json {"),
        ]));
        assert_eq!(event.result, Some(Value::String("not json {".to_string())));
    }

    #[test]
    fn unparsable_seq_falls_back_to_zero() {
        let event =
            StageEvent::from_stream_fields(&fields(&[("job_id", "j-1"), ("seq", "oops")]));
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn token_producer_aliases_are_normalized() {
        let event = StageEvent::from_stream_fields(&fields(&[
            ("task_id", "j-2"),
            ("event_type", "token"),
            ("content", "hi"),
            ("seq", "14"),
        ]));
        assert_eq!(event.job_id.as_str(), "j-2");
        assert!(event.is_token());
        assert_eq!(event.extra["content"], Value::String("hi".to_string()));
    }

    #[test]
    fn terminal_detection() {
        assert!(StageEvent::new("j", "done", "completed", 9).is_terminal());
        assert!(StageEvent::new("j", "answer", "failed", 4).is_terminal());
        assert!(!StageEvent::new("j", "vision", "started", 1).is_terminal());
    }

    #[test]
    fn json_round_trip_keeps_seq_and_position() {
        let mut event = StageEvent::new("j-3", "answer", "completed", 7);
        event.log_position = Some(StreamPosition::new(1000, 2));
        let json = serde_json::to_string(&event).unwrap();
        let back: StageEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(json.contains(r#""stream_id":"1000-2""#));
    }

    #[test]
    fn json_decode_tolerates_string_seq() {
        let back: StageEvent =
            serde_json::from_str(r#"{"job_id":"j","stage":"done","seq":"12"}"#).unwrap();
        assert_eq!(back.seq, 12);
    }
}
