//! In-memory [`EventStore`] and [`FanoutBus`] for tests.
//!
//! These mirror the observable semantics the pipeline relies on: consumer
//! groups with per-entry pending state, idle-claim with re-stamping, TTL'd
//! keys, the atomic verdict rules, and fan-out that only reaches live
//! subscribers. Timekeeping uses `tokio::time`, so tests can pause and
//! advance the clock to exercise reclaim and expiry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::{
    ApplyRequest, ApplyVerdict, BackendError, EventStore, FanoutBus, FanoutSubscription, LogEntry,
    Result,
};
use crate::types::StreamPosition;

#[derive(Debug, Clone)]
struct PendingDelivery {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream's entry vector of the next undelivered entry.
    next_index: usize,
    pending: HashMap<StreamPosition, PendingDelivery>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    /// key -> (value, expiry)
    kv: HashMap<String, (String, Option<Instant>)>,
    next_ms: u64,
}

impl Inner {
    fn kv_get(&self, key: &str, now: Instant) -> Option<&str> {
        match self.kv.get(key) {
            Some((_, Some(expiry))) if *expiry <= now => None,
            Some((value, _)) => Some(value.as_str()),
            None => None,
        }
    }
}

/// In-memory store. Clone-free by design: share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
    fail_apply: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends producer fields to a partition, returning the assigned
    /// position. Test-side stand-in for the upstream workers.
    pub fn append(&self, stream: &str, fields: HashMap<String, String>) -> StreamPosition {
        let mut inner = self.inner.lock().unwrap();
        inner.next_ms += 1;
        let position = StreamPosition::new(inner.next_ms, 0);
        inner
            .streams
            .entry(stream.to_owned())
            .or_default()
            .entries
            .push(LogEntry {
                position,
                fields,
            });
        position
    }

    /// Makes the next `apply_event` calls fail, to drive the
    /// ack-withholding path.
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Positions still pending for a group, for assertions.
    pub fn pending_positions(&self, stream: &str, group: &str) -> Vec<StreamPosition> {
        let inner = self.inner.lock().unwrap();
        let mut positions: Vec<StreamPosition> = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().copied().collect())
            .unwrap_or_default();
        positions.sort();
        positions
    }

    /// Directly seeds a key, with optional TTL. Test-side stand-in for
    /// upstream writers of token state.
    pub fn put_json(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        let expiry = ttl.map(|ttl| Instant::now() + ttl);
        inner.kv.insert(key.to_owned(), (value.to_owned(), expiry));
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.streams.entry(stream.to_owned()).or_default();
        // Group starts at the beginning of the stream, same as creating
        // on "0": entries logged before the group existed are delivered.
        state.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(String, Vec<LogEntry>)>> {
        for attempt in 0..2 {
            {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                let mut batches = Vec::new();
                for stream in streams {
                    let Some(state) = inner.streams.get_mut(stream) else {
                        continue;
                    };
                    let StreamState { entries, groups } = state;
                    let Some(group_state) = groups.get_mut(group) else {
                        return Err(BackendError::Unavailable(format!(
                            "no group {group} on {stream}"
                        )));
                    };
                    let start = group_state.next_index;
                    let end = entries.len().min(start + count);
                    if start >= end {
                        continue;
                    }
                    let delivered: Vec<LogEntry> = entries[start..end].to_vec();
                    for entry in &delivered {
                        group_state.pending.insert(
                            entry.position,
                            PendingDelivery {
                                consumer: consumer.to_owned(),
                                delivered_at: now,
                            },
                        );
                    }
                    group_state.next_index = end;
                    batches.push((stream.clone(), delivered));
                }
                if !batches.is_empty() {
                    return Ok(batches);
                }
            }
            if attempt == 0 {
                tokio::time::sleep(block).await;
            }
        }
        Ok(Vec::new())
    }

    async fn ack(&self, stream: &str, group: &str, position: StreamPosition) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.remove(&position);
        }
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let StreamState { entries, groups } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let mut idle: Vec<StreamPosition> = group_state
            .pending
            .iter()
            .filter(|(_, delivery)| now.saturating_duration_since(delivery.delivered_at) >= min_idle)
            .map(|(position, _)| *position)
            .collect();
        idle.sort();
        idle.truncate(count);
        let mut claimed = Vec::with_capacity(idle.len());
        for position in idle {
            // Re-stamp: a claimed entry counts as freshly delivered.
            group_state.pending.insert(
                position,
                PendingDelivery {
                    consumer: consumer.to_owned(),
                    delivered_at: now,
                },
            );
            if let Some(entry) = entries.iter().find(|e| e.position == position) {
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn apply_event(&self, request: &ApplyRequest) -> Result<ApplyVerdict> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("apply failure injected".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if inner.kv_get(&request.marker_key, now).is_some() {
            return Ok(ApplyVerdict::Duplicate);
        }
        let newer = match inner.kv_get(&request.state_key, now) {
            Some(current) => serde_json::from_str::<serde_json::Value>(current)
                .ok()
                .and_then(|v| v.get("seq").and_then(|s| s.as_i64()))
                .map(|current_seq| request.seq > current_seq)
                .unwrap_or(true),
            None => true,
        };
        if newer {
            inner.kv.insert(
                request.state_key.clone(),
                (request.payload.clone(), Some(now + request.state_ttl)),
            );
        }
        inner.kv.insert(
            request.marker_key.clone(),
            ("1".to_owned(), Some(now + request.marker_ttl)),
        );
        Ok(if newer {
            ApplyVerdict::Applied
        } else {
            ApplyVerdict::Stale
        })
    }

    async fn recent_entries(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state.entries.iter().rev().take(count).cloned().collect())
    }

    async fn range_after(
        &self,
        stream: &str,
        after: Option<StreamPosition>,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .filter(|e| after.map_or(true, |after| e.position > after))
            .take(count)
            .cloned()
            .collect())
    }

    async fn get_json(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.kv_get(key, Instant::now()).map(str::to_owned))
    }
}

/// In-memory fan-out over tokio broadcast channels.
#[derive(Default)]
pub struct MemoryFanoutBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    published: Mutex<Vec<(String, String)>>,
    fail_publish: AtomicBool,
}

impl MemoryFanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far, `(channel, payload)`, for assertions.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl FanoutBus for MemoryFanoutBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("publish failure injected".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((channel.to_owned(), payload.to_owned()));
        let sender = {
            let channels = self.channels.lock().unwrap();
            channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // No live subscribers is not an error; the message is simply lost,
            // same as real pub/sub.
            let _ = sender.send(payload.to_owned());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<FanoutSubscription> {
        let mut receiver = {
            let mut channels = self.channels.lock().unwrap();
            channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(FanoutSubscription::new(rx))
    }
}
