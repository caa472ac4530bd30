//! Token recovery for chat streams.
//!
//! Token deltas are too frequent for the state-snapshot machinery, so chat
//! producers maintain two extra structures: an accumulated-text key
//! (`chat:token_state:{job_id}`) and a dedicated delta stream
//! (`chat:tokens:{job_id}`). A reconnecting client gets the accumulated
//! text as one synthetic `token_recovery` event, then any deltas newer than
//! its last confirmed token seq.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::backend::{EventStore, Result};
use crate::sharding::{token_state_key, token_stream_key};
use crate::types::{JobId, StageEvent, STAGE_TOKEN};

/// Max deltas replayed per reconnect. The accumulated-text key covers the
/// prefix, so this only has to span what arrived since it was last written.
const TOKEN_SCAN: usize = 10_000;

/// Accumulated token state as maintained by the chat producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecovery {
    #[serde(default, alias = "text")]
    pub content: String,
    #[serde(default)]
    pub seq: i64,
}

impl TokenRecovery {
    /// The synthetic event body sent under the `token_recovery` name.
    pub fn to_event_body(&self, job_id: &JobId) -> serde_json::Value {
        json!({
            "job_id": job_id.as_str(),
            "stage": "token_recovery",
            "content": self.content,
            "seq": self.seq,
        })
    }
}

/// Reads accumulated token state for a job, if any.
pub async fn recover(
    store: &Arc<dyn EventStore>,
    job_id: &JobId,
) -> Result<Option<TokenRecovery>> {
    let Some(raw) = store.get_json(&token_state_key(job_id)).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(state) => Ok(Some(state)),
        Err(error) => {
            debug!(%job_id, %error, "undecodable token state, skipping recovery");
            Ok(None)
        }
    }
}

/// Token deltas with seq strictly greater than `after_seq`, oldest first,
/// rebuilt as `token` stage events so the queue's seq cursor applies.
pub async fn replay(
    store: &Arc<dyn EventStore>,
    job_id: &JobId,
    after_seq: i64,
) -> Result<Vec<StageEvent>> {
    let entries = store
        .range_after(&token_stream_key(job_id), None, TOKEN_SCAN)
        .await?;
    let mut events = Vec::new();
    for entry in entries {
        let seq = entry
            .fields
            .get("seq")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        if seq <= after_seq {
            continue;
        }
        let text = entry
            .fields
            .get("content")
            .or_else(|| entry.fields.get("text"))
            .or_else(|| entry.fields.get("token"))
            .cloned()
            .unwrap_or_default();
        let mut event = StageEvent::new(job_id.clone(), STAGE_TOKEN, "streaming", seq);
        event.result = Some(json!({ "content": text }));
        events.push(event);
    }
    Ok(events)
}
