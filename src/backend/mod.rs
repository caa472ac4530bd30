//! Ports to the two external backends.
//!
//! The pipeline talks to exactly two systems: a durable partitioned log with
//! consumer-group semantics plus a keyspace for state/markers (one
//! deployment), and an ephemeral pub/sub channel for low-latency fan-out
//! (possibly a different deployment with weaker durability). Each is a
//! narrow trait with one production implementation ([`redis`]) and one
//! in-memory fake ([`memory`]) used by tests and dry-run setups.
//!
//! Keeping the seams this narrow is what lets the fan-out layer degrade
//! gracefully: a publish miss is recoverable by catch-up reads of the log,
//! so the two backends never need cross-system transactions.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::StreamPosition;

/// Errors surfaced by either backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Underlying Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Consumer-group creation failed for a reason other than "already
    /// exists". This is one of the few process-fatal conditions.
    #[error("consumer group creation failed on {stream}: {message}")]
    GroupCreate { stream: String, message: String },

    /// Channel subscription could not be established.
    #[error("subscribe failed on {channel}: {message}")]
    Subscribe { channel: String, message: String },

    /// In-memory backend failure injection (tests) or misuse.
    #[error("{0}")]
    Unavailable(String),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// One delivered log entry: the log-assigned position plus the flat
/// string-keyed field map the producer appended.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub position: StreamPosition,
    pub fields: HashMap<String, String>,
}

/// Verdict of the atomic check-mark-update step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyVerdict {
    /// Marker was absent and `seq` was strictly newer: snapshot overwritten,
    /// marker set.
    Applied,
    /// Marker was absent but `seq` was not newer: marker set, snapshot left
    /// alone (out-of-order delivery).
    Stale,
    /// Marker already present: this `(job_id, seq)` was fully handled before.
    Duplicate,
}

/// Parameters of the atomic state transition (§ Event Processor).
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// `{domain}:state:{job_id}`
    pub state_key: String,
    /// `router:published:{job_id}:{seq}`
    pub marker_key: String,
    /// JSON-encoded event, stored verbatim as the snapshot on apply.
    pub payload: String,
    /// Producer sequence number being applied.
    pub seq: i64,
    /// TTL for the state snapshot.
    pub state_ttl: Duration,
    /// TTL for the idempotency marker; must outlive the state TTL.
    pub marker_ttl: Duration,
}

/// The durable log + state keyspace.
///
/// Entries are appended by upstream workers (out of scope here); this side
/// reads them through a consumer group, acknowledges them, reclaims stale
/// pending deliveries, and runs the atomic state transition. The whole
/// check-and-set-and-mark sequence is a single method because it MUST be a
/// single round trip: two router instances can race on the same job, and a
/// check-then-act split would lose that race.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Ensures the named consumer group exists on a partition, creating the
    /// partition if needed. Creating a group that already exists is not an
    /// error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Block-reads up to `count` new entries per partition for this consumer.
    /// Returns `(stream_key, entries)` pairs; an empty result after the block
    /// timeout is normal.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(String, Vec<LogEntry>)>>;

    /// Acknowledges one delivered entry.
    async fn ack(&self, stream: &str, group: &str, position: StreamPosition) -> Result<()>;

    /// Atomically claims entries pending longer than `min_idle`, transferring
    /// ownership to `consumer`. A partition with no consumer group yet is not
    /// an error and yields an empty batch.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Runs the atomic check-mark-update round trip (§ Event Processor).
    async fn apply_event(&self, request: &ApplyRequest) -> Result<ApplyVerdict>;

    /// Reads the most recent `count` entries of a partition, newest first.
    /// Used by catch-up, which then filters and re-sorts by producer seq.
    async fn recent_entries(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>>;

    /// Reads entries strictly after `after` (or from the start), ascending,
    /// capped at `count`. Used by the token sub-stream recovery.
    async fn range_after(
        &self,
        stream: &str,
        after: Option<StreamPosition>,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Fetches a JSON blob by key (state snapshots, token state). `None` when
    /// absent or expired.
    async fn get_json(&self, key: &str) -> Result<Option<String>>;
}

/// The ephemeral fan-out channel. No persistence, no replay.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Publishes a payload to a channel. Delivered only to currently
    /// connected subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribes to a channel. When this method returns `Ok`, the
    /// subscription is active server-side: messages published afterwards
    /// will be delivered. This is the readiness point the gateway's
    /// subscribe protocol waits on.
    async fn subscribe(&self, channel: &str) -> Result<FanoutSubscription>;
}

/// A live channel subscription. Dropping it tears the subscription down.
pub struct FanoutSubscription {
    rx: mpsc::Receiver<String>,
}

impl FanoutSubscription {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        FanoutSubscription { rx }
    }

    /// Waits for the next message; `None` means the subscription ended
    /// (backend closed or connection lost).
    pub async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}
