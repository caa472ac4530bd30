//! Per-job fan-out listeners and the per-connection delivery loop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{EventStore, FanoutBus};
use crate::config::RelayConfig;
use crate::gateway::queue::SubscriberQueue;
use crate::gateway::{catchup, tokens};
use crate::sharding::{fanout_channel, state_key};
use crate::types::{Domain, JobId, StageEvent, StreamPosition};

/// How long `subscribe` waits for the job's fan-out listener to confirm its
/// channel subscription. Exceeding it is not fatal: catch-up covers
/// anything published before the listener came up.
const LISTENER_READY_TIMEOUT: Duration = Duration::from_secs(1);

/// Parameters of one client subscription.
#[derive(Debug, Clone)]
pub struct SubscribeParams {
    pub domain: Domain,
    pub job_id: JobId,
    /// Log position of the last event the client received, from the
    /// standard `Last-Event-ID` reconnect header.
    pub last_event_id: Option<StreamPosition>,
    /// Last token seq the client received, for chat reconnects.
    pub last_token_seq: Option<i64>,
    /// Run the token recovery pass before the live loop (chat streams).
    pub token_recovery: bool,
}

/// One frame of a client stream.
#[derive(Debug)]
pub enum StreamFrame {
    Event(StageEvent),
    /// Synthetic accumulated-token event, sent at most once per connection.
    TokenRecovery(serde_json::Value),
    Keepalive,
    /// The connection hit its lifetime cap and is closing.
    Timeout,
}

/// The receiving end of one subscription, consumed by the HTTP layer.
pub struct EventStream {
    rx: mpsc::Receiver<StreamFrame>,
}

impl Stream for EventStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct ListenerHandle {
    cancel: CancellationToken,
    ready: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<JobId, Vec<Arc<SubscriberQueue>>>,
    listeners: HashMap<JobId, ListenerHandle>,
}

/// Shared fan-out state: at most one pub/sub listener per watched job,
/// dispatching into every subscriber queue registered for that job.
pub struct BroadcastManager {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn FanoutBus>,
    config: RelayConfig,
    registry: Mutex<Registry>,
}

impl BroadcastManager {
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<dyn FanoutBus>, config: RelayConfig) -> Self {
        BroadcastManager {
            store,
            bus,
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Cancels every fan-out listener. Called on process shutdown so channel
    /// subscriptions close before the backend connections drop.
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock().unwrap();
        for (_, handle) in registry.listeners.drain() {
            handle.cancel.cancel();
        }
        registry.subscribers.clear();
    }

    /// `(subscriber queues, active listeners)`, for health reporting.
    pub fn counts(&self) -> (usize, usize) {
        let registry = self.registry.lock().unwrap();
        let subscribers = registry.subscribers.values().map(Vec::len).sum();
        (subscribers, registry.listeners.len())
    }

    /// Opens a client stream. The returned stream yields frames until the
    /// job reaches a terminal event, the lifetime cap fires, or the client
    /// goes away (drops the stream).
    pub fn subscribe(self: &Arc<Self>, params: SubscribeParams) -> EventStream {
        let (tx, rx) = mpsc::channel(32);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.connection_loop(params, tx).await;
        });
        EventStream { rx }
    }

    async fn connection_loop(self: Arc<Self>, params: SubscribeParams, tx: mpsc::Sender<StreamFrame>) {
        let SubscribeParams {
            domain,
            job_id,
            last_event_id,
            last_token_seq,
            token_recovery,
        } = params;
        let stage_cursor = last_event_id.unwrap_or_default();
        let queue = Arc::new(SubscriberQueue::new(
            self.config.queue_capacity,
            stage_cursor,
            last_token_seq.unwrap_or(0),
        ));

        // Register before the listener comes up, so there is no window in
        // which a dispatched event finds no queue.
        self.register(&job_id, queue.clone());
        self.ensure_listener(&job_id).await;

        if token_recovery {
            self.recover_tokens(&job_id, last_token_seq.unwrap_or(0), &queue, &tx)
                .await;
        }

        // Catch up from the log whenever the snapshot is ahead of the
        // client's cursor. On a first connect to a job in flight that is
        // always the case, and the replay carries the intermediate events
        // (earlier stages' results) the snapshot alone would drop. The
        // position cursor absorbs the replay/snapshot overlap.
        let snapshot = self.load_snapshot(&domain, &job_id).await;
        let snapshot_ahead = snapshot.as_ref().is_some_and(|event| {
            event
                .log_position
                .map_or(true, |position| position > queue.stage_cursor())
        });
        if snapshot_ahead {
            self.replay_into(&domain, &job_id, &queue).await;
        }
        if let Some(snapshot) = snapshot {
            queue.put(snapshot);
        }

        self.live_loop(&domain, &job_id, &queue, &tx).await;
        self.deregister(&job_id, &queue);
    }

    async fn live_loop(
        &self,
        domain: &Domain,
        job_id: &JobId,
        queue: &Arc<SubscriberQueue>,
        tx: &mpsc::Sender<StreamFrame>,
    ) {
        let started = Instant::now();
        let mut last_state_check = Instant::now();
        loop {
            if started.elapsed() >= self.config.max_wait {
                let _ = tx.send(StreamFrame::Timeout).await;
                info!(%job_id, "stream hit lifetime cap");
                return;
            }
            match queue.pop(self.config.keepalive).await {
                Some(event) => {
                    let terminal = event.is_terminal();
                    if tx.send(StreamFrame::Event(event)).await.is_err() {
                        debug!(%job_id, "client gone");
                        return;
                    }
                    if terminal {
                        debug!(%job_id, "terminal event delivered, closing stream");
                        return;
                    }
                }
                None => {
                    if tx.send(StreamFrame::Keepalive).await.is_err() {
                        debug!(%job_id, "client gone");
                        return;
                    }
                    if last_state_check.elapsed() >= self.config.state_recheck {
                        last_state_check = Instant::now();
                        self.recheck_snapshot(domain, job_id, queue).await;
                    }
                }
            }
        }
    }

    /// Idle-path recovery: the fan-out publish for some event may have been
    /// lost, but the state snapshot is durable. If the snapshot is ahead of
    /// the client's cursor, requeue it; if it is terminal, also replay the
    /// log so nothing between cursor and terminal is skipped.
    async fn recheck_snapshot(&self, domain: &Domain, job_id: &JobId, queue: &Arc<SubscriberQueue>) {
        let Some(snapshot) = self.load_snapshot(domain, job_id).await else {
            return;
        };
        let newer = snapshot
            .log_position
            .map_or(true, |position| position > queue.stage_cursor());
        if !newer {
            return;
        }
        if snapshot.is_terminal() {
            self.replay_into(domain, job_id, queue).await;
        }
        queue.put(snapshot);
    }

    async fn replay_into(&self, domain: &Domain, job_id: &JobId, queue: &Arc<SubscriberQueue>) {
        let Some(shard_count) = self.config.shard_count(domain) else {
            return;
        };
        match catchup::replay(&self.store, domain, job_id, shard_count, queue.stage_cursor()).await
        {
            Ok(events) => {
                for event in events {
                    queue.put(event);
                }
            }
            Err(error) => warn!(%job_id, %error, "log catch-up failed"),
        }
    }

    async fn recover_tokens(
        &self,
        job_id: &JobId,
        client_token_seq: i64,
        queue: &Arc<SubscriberQueue>,
        tx: &mpsc::Sender<StreamFrame>,
    ) {
        let mut after_seq = client_token_seq;
        match tokens::recover(&self.store, job_id).await {
            Ok(Some(state)) => {
                if state.seq > after_seq {
                    after_seq = state.seq;
                    let _ = tx
                        .send(StreamFrame::TokenRecovery(state.to_event_body(job_id)))
                        .await;
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%job_id, %error, "token state read failed"),
        }
        match tokens::replay(&self.store, job_id, after_seq).await {
            Ok(deltas) => {
                for delta in deltas {
                    queue.put(delta);
                }
            }
            Err(error) => warn!(%job_id, %error, "token replay failed"),
        }
    }

    async fn load_snapshot(&self, domain: &Domain, job_id: &JobId) -> Option<StageEvent> {
        match self.store.get_json(&state_key(domain, job_id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(event) => Some(event),
                Err(error) => {
                    warn!(%job_id, %error, "undecodable state snapshot");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(%job_id, %error, "state snapshot read failed");
                None
            }
        }
    }

    fn register(&self, job_id: &JobId, queue: Arc<SubscriberQueue>) {
        let mut registry = self.registry.lock().unwrap();
        registry
            .subscribers
            .entry(job_id.clone())
            .or_default()
            .push(queue);
    }

    fn deregister(&self, job_id: &JobId, queue: &Arc<SubscriberQueue>) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(queues) = registry.subscribers.get_mut(job_id) {
            queues.retain(|q| !Arc::ptr_eq(q, queue));
            if queues.is_empty() {
                registry.subscribers.remove(job_id);
                // Last subscriber gone: the listener has nobody to feed.
                if let Some(handle) = registry.listeners.remove(job_id) {
                    handle.cancel.cancel();
                }
            }
        }
    }

    /// Starts the job's fan-out listener if absent, then waits (bounded)
    /// for it to confirm its channel subscription.
    async fn ensure_listener(self: &Arc<Self>, job_id: &JobId) {
        let mut ready = {
            let mut registry = self.registry.lock().unwrap();
            match registry.listeners.get(job_id) {
                Some(handle) => handle.ready.clone(),
                None => {
                    let cancel = CancellationToken::new();
                    let (ready_tx, ready_rx) = watch::channel(false);
                    registry.listeners.insert(
                        job_id.clone(),
                        ListenerHandle {
                            cancel: cancel.clone(),
                            ready: ready_rx.clone(),
                        },
                    );
                    let manager = self.clone();
                    let job_id = job_id.clone();
                    tokio::spawn(async move {
                        manager.run_listener(job_id, cancel, ready_tx).await;
                    });
                    ready_rx
                }
            }
        };
        let confirmed = timeout(LISTENER_READY_TIMEOUT, ready.wait_for(|ready| *ready)).await;
        if !matches!(confirmed, Ok(Ok(_))) {
            warn!(%job_id, "fan-out listener not confirmed in time, relying on catch-up");
        }
    }

    async fn run_listener(
        self: Arc<Self>,
        job_id: JobId,
        cancel: CancellationToken,
        ready_tx: watch::Sender<bool>,
    ) {
        let channel = fanout_channel(&job_id);
        let mut subscription = match self.bus.subscribe(&channel).await {
            Ok(subscription) => {
                let _ = ready_tx.send(true);
                subscription
            }
            Err(error) => {
                warn!(%job_id, %error, "fan-out subscribe failed");
                self.registry.lock().unwrap().listeners.remove(&job_id);
                return;
            }
        };
        debug!(%job_id, "fan-out listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscription.next_message() => match message {
                    Some(payload) => match serde_json::from_str::<StageEvent>(&payload) {
                        Ok(event) => self.dispatch(&job_id, event),
                        Err(error) => {
                            warn!(%job_id, %error, "undecodable fan-out event");
                        }
                    },
                    None => {
                        warn!(%job_id, "fan-out subscription ended");
                        break;
                    }
                },
            }
        }
        self.registry.lock().unwrap().listeners.remove(&job_id);
        debug!(%job_id, "fan-out listener stopped");
    }

    /// Fans one live event out to every queue watching the job.
    fn dispatch(&self, job_id: &JobId, event: StageEvent) {
        let queues = {
            let registry = self.registry.lock().unwrap();
            registry.subscribers.get(job_id).cloned().unwrap_or_default()
        };
        for queue in queues {
            queue.put(event.clone());
        }
    }
}
