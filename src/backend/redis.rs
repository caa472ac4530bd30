//! Redis-backed implementations of [`EventStore`] and [`FanoutBus`].
//!
//! The store runs against a Redis instance with streams support; the bus
//! against plain pub/sub, usually (but not necessarily) the same instance.
//! All stream reads go through a consumer group so delivery is at-least-once
//! and reclaimable; the idempotency marker makes the pipeline effectively
//! exactly-once downstream of the atomic apply.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ApplyRequest, ApplyVerdict, BackendError, EventStore, FanoutBus, FanoutSubscription, LogEntry,
    Result,
};
use crate::types::StreamPosition;

/// The atomic check-mark-update step, kept server-side so that two router
/// instances racing on the same `(job_id, seq)` cannot interleave between
/// the marker check and the snapshot write.
///
/// KEYS[1] = marker key, KEYS[2] = state key
/// ARGV[1] = seq, ARGV[2] = payload, ARGV[3] = state TTL (s), ARGV[4] = marker TTL (s)
///
/// Returns 2 (applied), 1 (stale, marked but snapshot untouched), 0 (duplicate).
const APPLY_EVENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
local seq = tonumber(ARGV[1])
local current = redis.call('GET', KEYS[2])
local newer = true
if current then
    local ok, decoded = pcall(cjson.decode, current)
    if ok and decoded and decoded['seq'] and tonumber(decoded['seq']) >= seq then
        newer = false
    end
end
if newer then
    redis.call('SETEX', KEYS[2], tonumber(ARGV[3]), ARGV[2])
end
redis.call('SETEX', KEYS[1], tonumber(ARGV[4]), '1')
if newer then
    return 2
else
    return 1
end
"#;

/// [`EventStore`] over multiplexed Redis connections.
///
/// The connection handles are cheap to clone; every call clones one so the
/// store itself can sit behind an `Arc` and be shared across the consumer,
/// reclaimer, and gateway tasks. Blocking XREADGROUP calls get their own
/// connection: Redis serves a connection's commands serially, so a 5s block
/// on the shared handle would stall every ack, apply, and snapshot read
/// issued while the consumer sits idle.
pub struct RedisEventStore {
    conn: MultiplexedConnection,
    /// Used only by `read_group`, which blocks server-side.
    block_conn: MultiplexedConnection,
    apply_script: Script,
}

impl RedisEventStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        let block_conn = client.get_multiplexed_tokio_connection().await?;
        Ok(RedisEventStore {
            conn,
            block_conn,
            apply_script: Script::new(APPLY_EVENT_SCRIPT),
        })
    }
}

fn entry_from_stream_id(id: &StreamId) -> LogEntry {
    let position = StreamPosition::parse_lossy(&id.id);
    let mut fields = HashMap::with_capacity(id.map.len());
    for (key, value) in &id.map {
        match redis::from_redis_value::<String>(value) {
            Ok(text) => {
                fields.insert(key.clone(), text);
            }
            Err(error) => {
                debug!(field = %key, %error, "skipping non-string stream field");
            }
        }
    }
    LogEntry { position, fields }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // Start at the beginning of the partition: entries logged before
        // this group existed (jobs in flight across a deploy) must still
        // be delivered.
        let created: std::result::Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            // Group already exists: fine, another instance got there first.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BackendError::GroupCreate {
                stream: stream.to_owned(),
                message: e.to_string(),
            }),
        }
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(String, Vec<LogEntry>)>> {
        let mut conn = self.block_conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: StreamReadReply = conn.xread_options(streams, &ids, &options).await?;
        let mut batches = Vec::with_capacity(reply.keys.len());
        for key in reply.keys {
            let entries = key.ids.iter().map(entry_from_stream_id).collect::<Vec<_>>();
            batches.push((key.key, entries));
        }
        Ok(batches)
    }

    async fn ack(&self, stream: &str, group: &str, position: StreamPosition) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[position.to_string()])
            .await?;
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
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(count);
        let reply: std::result::Result<StreamAutoClaimReply, redis::RedisError> = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                "0-0",
                options,
            )
            .await;
        match reply {
            Ok(reply) => Ok(reply.claimed.iter().map(entry_from_stream_id).collect()),
            // Partition has no group yet: nothing has ever been routed on
            // this shard, so there is nothing to reclaim.
            Err(e) if e.code() == Some("NOGROUP") => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_event(&self, request: &ApplyRequest) -> Result<ApplyVerdict> {
        let mut conn = self.conn.clone();
        let verdict: i64 = self
            .apply_script
            .key(&request.marker_key)
            .key(&request.state_key)
            .arg(request.seq)
            .arg(&request.payload)
            .arg(request.state_ttl.as_secs())
            .arg(request.marker_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(match verdict {
            2 => ApplyVerdict::Applied,
            1 => ApplyVerdict::Stale,
            _ => ApplyVerdict::Duplicate,
        })
    }

    async fn recent_entries(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", count).await?;
        Ok(reply.ids.iter().map(entry_from_stream_id).collect())
    }

    async fn range_after(
        &self,
        stream: &str,
        after: Option<StreamPosition>,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let start = match after {
            // "(" makes the lower bound exclusive.
            Some(position) => format!("({position}"),
            None => "-".to_owned(),
        };
        let reply: StreamRangeReply = conn.xrange_count(stream, start, "+", count).await?;
        Ok(reply.ids.iter().map(entry_from_stream_id).collect())
    }

    async fn get_json(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }
}

/// [`FanoutBus`] over Redis pub/sub.
///
/// Each subscription takes a dedicated pub/sub connection; the forwarder
/// task pumps messages into a bounded channel and exits when the gateway
/// drops its receiver.
pub struct RedisFanoutBus {
    client: redis::Client,
    publish_conn: MultiplexedConnection,
}

impl RedisFanoutBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publish_conn = client.get_multiplexed_tokio_connection().await?;
        Ok(RedisFanoutBus {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl FanoutBus for RedisFanoutBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publish_conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<FanoutSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        // SUBSCRIBE has completed server-side once this returns, so the
        // caller may treat the subscription as live.
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BackendError::Subscribe {
                channel: channel.to_owned(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(256);
        let channel_name = channel.to_owned();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(channel = %channel_name, %error, "undecodable fan-out payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Receiver gone: the listener was cancelled.
                    break;
                }
            }
            debug!(channel = %channel_name, "fan-out forwarder stopped");
        });

        Ok(FanoutSubscription::new(rx))
    }
}
