//! Periodic sweep of deliveries that were read but never acknowledged.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::EventStore;
use crate::config::RelayConfig;
use crate::router::processor::EventProcessor;

const RECLAIM_BATCH: usize = 10;

/// Claims entries left pending past the idle threshold and reprocesses
/// them. The idempotency marker makes reprocessing an already-applied entry
/// a no-op, so claiming an entry whose original consumer is merely slow is
/// harmless.
pub struct PendingReclaimer {
    store: Arc<dyn EventStore>,
    processor: Arc<EventProcessor>,
    streams: Vec<String>,
    group: String,
    consumer_name: String,
    min_idle: Duration,
    scan_interval: Duration,
}

impl PendingReclaimer {
    pub fn new(
        store: Arc<dyn EventStore>,
        processor: Arc<EventProcessor>,
        streams: Vec<String>,
        config: &RelayConfig,
    ) -> Self {
        PendingReclaimer {
            store,
            processor,
            streams,
            group: config.consumer_group.clone(),
            consumer_name: format!("{}-reclaim", config.consumer_name),
            min_idle: config.reclaim_min_idle,
            scan_interval: config.reclaim_interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            min_idle_secs = self.min_idle.as_secs(),
            interval_secs = self.scan_interval.as_secs(),
            "pending reclaimer started"
        );
        let mut tick = interval(self.scan_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of `interval` fires immediately; consume it so the
        // first scan waits a full period after startup.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.scan_once().await,
            }
        }
        info!("pending reclaimer stopped");
    }

    /// One pass over every partition. Only successfully reprocessed entries
    /// are acknowledged; anything that fails again stays pending for the
    /// next pass.
    pub async fn scan_once(&self) {
        for stream in &self.streams {
            let claimed = match self
                .store
                .claim_idle(
                    stream,
                    &self.group,
                    &self.consumer_name,
                    self.min_idle,
                    RECLAIM_BATCH,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(error) => {
                    warn!(%stream, %error, "claim failed");
                    continue;
                }
            };
            if claimed.is_empty() {
                continue;
            }
            debug!(%stream, count = claimed.len(), "reclaimed pending entries");
            for entry in claimed {
                match self.processor.process(stream, &entry).await {
                    Ok(_) => {
                        if let Err(error) =
                            self.store.ack(stream, &self.group, entry.position).await
                        {
                            warn!(%stream, position = %entry.position, %error, "ack failed");
                        }
                    }
                    Err(error) => {
                        warn!(
                            %stream,
                            position = %entry.position,
                            %error,
                            "reprocessing failed, leaving pending"
                        );
                    }
                }
            }
        }
    }
}
