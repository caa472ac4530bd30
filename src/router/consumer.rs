//! Consumer-group reader over a fixed set of log partitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{BackendError, EventStore, LogEntry};
use crate::config::RelayConfig;
use crate::router::processor::{EventProcessor, ProcessorError};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Reads every shard of every configured domain through one consumer group
/// and feeds entries to the processor.
///
/// Acknowledgement policy: an entry is acked whenever we know its outcome,
/// including decode-level skips. The only withheld ack is a failed atomic
/// apply, where the entry's effect is unknown; the idempotency marker makes
/// its redelivery safe.
pub struct ShardConsumer {
    store: Arc<dyn EventStore>,
    processor: Arc<EventProcessor>,
    streams: Vec<String>,
    group: String,
    consumer_name: String,
    read_count: usize,
    read_block: Duration,
}

impl ShardConsumer {
    pub fn new(
        store: Arc<dyn EventStore>,
        processor: Arc<EventProcessor>,
        config: &RelayConfig,
    ) -> Self {
        ShardConsumer {
            store,
            processor,
            streams: config.stream_keys(),
            group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            read_count: config.xread_count,
            read_block: config.xread_block,
        }
    }

    /// Partition keys this consumer reads, in shard order.
    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Creates the consumer group on every partition. Fatal on failure:
    /// running without a group would silently read nothing.
    pub async fn setup(&self) -> Result<(), BackendError> {
        for stream in &self.streams {
            self.store.ensure_group(stream, &self.group).await?;
        }
        info!(
            partitions = self.streams.len(),
            group = %self.group,
            consumer = %self.consumer_name,
            "consumer group ready"
        );
        Ok(())
    }

    /// Read-process-ack loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(consumer = %self.consumer_name, "shard consumer started");
        loop {
            let batches = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.store.read_group(
                    &self.streams,
                    &self.group,
                    &self.consumer_name,
                    self.read_count,
                    self.read_block,
                ) => result,
            };
            match batches {
                Ok(batches) => {
                    for (stream, entries) in batches {
                        for entry in entries {
                            self.handle_entry(&stream, &entry).await;
                        }
                    }
                }
                Err(error) => {
                    error!(%error, "log read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!(consumer = %self.consumer_name, "shard consumer stopped");
    }

    async fn handle_entry(&self, stream: &str, entry: &LogEntry) {
        match self.processor.process(stream, entry).await {
            Ok(_) => {
                if let Err(error) = self.store.ack(stream, &self.group, entry.position).await {
                    warn!(%stream, position = %entry.position, %error, "ack failed");
                }
            }
            Err(ProcessorError::Store(error)) => {
                // Unknown effect: leave the entry pending for the reclaimer.
                warn!(
                    %stream,
                    position = %entry.position,
                    %error,
                    "apply failed, withholding ack"
                );
            }
            Err(error) => {
                warn!(%stream, position = %entry.position, %error, "unprocessable entry, acking");
                if let Err(error) = self.store.ack(stream, &self.group, entry.position).await {
                    warn!(%stream, position = %entry.position, %error, "ack failed");
                }
            }
        }
    }
}
