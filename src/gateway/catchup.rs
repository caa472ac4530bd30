//! Catch-up reads against the durable log.
//!
//! Fan-out is best-effort: a publish can fail, and a client can connect
//! after events were published. Both gaps are closed by reading the job's
//! partition directly. The partition is shared by every job on the shard,
//! so the read over-fetches recent entries and filters down to this job.

use std::sync::Arc;

use crate::backend::{EventStore, Result};
use crate::sharding::stream_key_for_job;
use crate::types::{Domain, JobId, StageEvent, StreamPosition};

/// How many recent entries to inspect per catch-up pass. A job's events are
/// interleaved with other jobs on the shard, so this bounds the lookback
/// window rather than the per-job yield.
const CATCHUP_SCAN: usize = 100;

/// Events for `job_id` logged strictly after `after`, oldest first.
pub async fn replay(
    store: &Arc<dyn EventStore>,
    domain: &Domain,
    job_id: &JobId,
    shard_count: u32,
    after: StreamPosition,
) -> Result<Vec<StageEvent>> {
    let stream = stream_key_for_job(domain, job_id, shard_count);
    let entries = store.recent_entries(&stream, CATCHUP_SCAN).await?;

    let mut events = Vec::new();
    // Entries arrive newest first; everything at or before the cursor is
    // already past the window, and the scan below it would be too.
    for entry in entries {
        if entry.position <= after {
            break;
        }
        let mut event = StageEvent::from_stream_fields(&entry.fields);
        if event.job_id != *job_id {
            continue;
        }
        event.log_position = Some(entry.position);
        events.push(event);
    }
    events.reverse();
    Ok(events)
}
