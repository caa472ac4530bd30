//! Per-entry processing: decode, atomically apply, fan out.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{ApplyRequest, ApplyVerdict, BackendError, EventStore, FanoutBus, LogEntry};
use crate::sharding::{fanout_channel, marker_key, state_key};
use crate::types::{Domain, StageEvent};

const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_BACKOFF: Duration = Duration::from_millis(100);

/// What happened to one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State snapshot advanced; event published.
    Applied,
    /// Out-of-order arrival: marked, snapshot untouched, still published so
    /// live subscribers see every event exactly once.
    Stale,
    /// Already fully handled; nothing published.
    Duplicate,
    /// Entry carried no job id; nothing to route.
    Skipped,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The atomic apply round trip failed. The caller must NOT acknowledge
    /// the entry: the reclaimer will redeliver it.
    #[error(transparent)]
    Store(#[from] BackendError),

    /// The decoded event would not re-serialize. Effectively unreachable for
    /// events built by [`StageEvent::from_stream_fields`], but the type
    /// system cannot know that.
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stateless processing core shared by the consumer and the reclaimer.
pub struct EventProcessor {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn FanoutBus>,
    state_ttl: Duration,
    marker_ttl: Duration,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        bus: Arc<dyn FanoutBus>,
        state_ttl: Duration,
        marker_ttl: Duration,
    ) -> Self {
        EventProcessor {
            store,
            bus,
            state_ttl,
            marker_ttl,
        }
    }

    /// Processes one delivered entry from `stream`.
    ///
    /// Token events bypass the state machine entirely: they are too frequent
    /// to snapshot and their replay path is the token sub-stream, not the
    /// state key. Everything else goes through the atomic apply; only a
    /// backend failure on that round trip is an error, because it is the one
    /// case where we cannot tell whether the event took effect.
    pub async fn process(
        &self,
        stream: &str,
        entry: &LogEntry,
    ) -> Result<Outcome, ProcessorError> {
        let mut event = StageEvent::from_stream_fields(&entry.fields);
        if event.job_id.is_empty() {
            warn!(%stream, position = %entry.position, "entry without job id, skipping");
            return Ok(Outcome::Skipped);
        }
        event.log_position = Some(entry.position);

        if event.is_token() {
            let payload = serde_json::to_string(&event)?;
            self.publish_with_retry(&event, &payload).await;
            return Ok(Outcome::Applied);
        }

        let domain = Domain::of_stream_key(stream);
        let payload = serde_json::to_string(&event)?;
        let verdict = self
            .store
            .apply_event(&ApplyRequest {
                state_key: state_key(&domain, &event.job_id),
                marker_key: marker_key(&event.job_id, event.seq),
                payload: payload.clone(),
                seq: event.seq,
                state_ttl: self.state_ttl,
                marker_ttl: self.marker_ttl,
            })
            .await?;

        match verdict {
            ApplyVerdict::Duplicate => {
                debug!(job_id = %event.job_id, seq = event.seq, "duplicate entry, not republishing");
                Ok(Outcome::Duplicate)
            }
            ApplyVerdict::Stale => {
                self.publish_with_retry(&event, &payload).await;
                Ok(Outcome::Stale)
            }
            ApplyVerdict::Applied => {
                self.publish_with_retry(&event, &payload).await;
                Ok(Outcome::Applied)
            }
        }
    }

    /// Publishes to the job's fan-out channel, retrying a few times with a
    /// growing pause. Exhaustion is logged, not fatal: the event is already
    /// durable in the log and in the state snapshot, so reconnect catch-up
    /// will deliver it.
    async fn publish_with_retry(&self, event: &StageEvent, payload: &str) {
        let channel = fanout_channel(&event.job_id);
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.bus.publish(&channel, payload).await {
                Ok(()) => return,
                Err(error) if attempt < PUBLISH_ATTEMPTS => {
                    debug!(
                        job_id = %event.job_id,
                        seq = event.seq,
                        attempt,
                        %error,
                        "fan-out publish failed, retrying"
                    );
                    tokio::time::sleep(PUBLISH_BACKOFF * attempt).await;
                }
                Err(error) => {
                    warn!(
                        job_id = %event.job_id,
                        seq = event.seq,
                        %error,
                        "fan-out publish failed, subscribers will rely on catch-up"
                    );
                }
            }
        }
    }
}
