//! Bounded per-subscriber event buffer with duplicate suppression.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::types::{StageEvent, StreamPosition};

/// What `put` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Accepted and buffered.
    Queued,
    /// Accepted; the oldest non-terminal buffered event was evicted to make
    /// room.
    QueuedEvictedOldest,
    /// Rejected: already seen, per the relevant cursor.
    Deduplicated,
    /// Rejected: queue full and every buffered event is terminal.
    Rejected,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<StageEvent>,
    /// Highest producer seq seen for `token` events. Tokens are deduplicated
    /// by seq because the recovery path replays them without log positions.
    last_token_seq: i64,
    /// Highest log position seen for everything else. Catch-up and the live
    /// listener overlap by design; this cursor removes the overlap.
    last_stage_cursor: StreamPosition,
    dropped: u64,
}

/// A single client's buffer between the fan-out listener and its stream.
///
/// Writers are the per-job listener task and the catch-up paths; the reader
/// is the one connection task. Capacity is enforced by evicting the oldest
/// non-terminal event, so a `done` or `failed` event, once buffered, cannot
/// be displaced by a burst of progress updates.
pub struct SubscriberQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    /// `stage_cursor` and `token_seq` seed the duplicate-suppression
    /// cursors, so a reconnecting client does not re-receive what it already
    /// acknowledged via `Last-Event-ID` or its token seq.
    pub fn new(capacity: usize, stage_cursor: StreamPosition, token_seq: i64) -> Self {
        SubscriberQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                last_token_seq: token_seq,
                last_stage_cursor: stage_cursor,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn put(&self, event: StageEvent) -> PutResult {
        let mut inner = self.inner.lock().unwrap();

        if event.is_token() {
            if event.seq <= inner.last_token_seq {
                return PutResult::Deduplicated;
            }
            inner.last_token_seq = event.seq;
        } else if let Some(position) = event.log_position {
            if position <= inner.last_stage_cursor {
                return PutResult::Deduplicated;
            }
            inner.last_stage_cursor = position;
        }
        // Synthetic events (no position, not tokens) always pass: they are
        // produced at most once per connection.

        let mut result = PutResult::Queued;
        if inner.items.len() >= self.capacity {
            match inner.items.iter().position(|e| !e.is_terminal()) {
                Some(index) => {
                    inner.items.remove(index);
                    inner.dropped += 1;
                    result = PutResult::QueuedEvictedOldest;
                }
                // Every buffered event is terminal; one of them already
                // closes the stream, so the incoming event adds nothing
                // and capacity stays a hard bound.
                None => return PutResult::Rejected,
            }
        }
        inner.items.push_back(event);
        drop(inner);
        self.notify.notify_one();
        result
    }

    /// Waits up to `wait` for an event. `None` means the wait elapsed.
    pub async fn pop(&self, wait: Duration) -> Option<StageEvent> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            // The permit may have been granted for an event another call
            // already took, so always re-check the buffer after waking.
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.try_pop();
            }
        }
    }

    fn try_pop(&self) -> Option<StageEvent> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events evicted due to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Current stage cursor, used by the idle snapshot check to decide
    /// whether a snapshot is news to this client.
    pub fn stage_cursor(&self) -> StreamPosition {
        self.inner.lock().unwrap().last_stage_cursor
    }
}
