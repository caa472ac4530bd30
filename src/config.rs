//! Process configuration, read once at startup from `RELAY_*` environment
//! variables. Every knob has a production-sane default, so the zero-config
//! case points at a local Redis and serves the `scan` and `chat` domains.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::sharding::stream_key;
use crate::types::Domain;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

/// One consumed domain and its partition count.
///
/// The shard count must match the producers' setting for that domain: both
/// sides hash job ids with the same function, so disagreement splits a
/// job's events across partitions nobody reads consistently.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: Domain,
    pub shard_count: u32,
}

/// Full runtime configuration for the relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis deployment holding the durable log and state keyspace.
    pub streams_url: String,
    /// Redis deployment carrying pub/sub fan-out. Defaults to `streams_url`
    /// but may point at a separate, less durable instance.
    pub pubsub_url: String,
    /// Domains whose partitioned logs this process consumes.
    pub domains: Vec<DomainConfig>,
    /// Consumer group name shared by all relay instances.
    pub consumer_group: String,
    /// This instance's consumer name within the group.
    pub consumer_name: String,
    /// Max entries per partition per group read.
    pub xread_count: usize,
    /// Block timeout for the group read.
    pub xread_block: Duration,
    /// TTL on `{domain}:state:{job_id}` snapshots.
    pub state_ttl: Duration,
    /// TTL on `router:published:{job_id}:{seq}` markers. Longer than the
    /// state TTL so a replayed entry stays deduplicated after its snapshot
    /// has expired.
    pub marker_ttl: Duration,
    /// How often the reclaimer scans for stuck pending entries.
    pub reclaim_interval: Duration,
    /// Minimum pending idle time before an entry is claimed.
    pub reclaim_min_idle: Duration,
    /// Per-subscriber buffered event cap.
    pub queue_capacity: usize,
    /// SSE keepalive cadence.
    pub keepalive: Duration,
    /// How often an idle subscriber re-checks the state snapshot.
    pub state_recheck: Duration,
    /// Hard per-connection lifetime cap.
    pub max_wait: Duration,
    /// HTTP bind address.
    pub listen_addr: SocketAddr,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let streams_url =
            optional("RELAY_REDIS_STREAMS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into());
        let pubsub_url = optional("RELAY_REDIS_PUBSUB_URL").unwrap_or_else(|| streams_url.clone());

        let default_shards: u32 = parsed("RELAY_SHARD_COUNT", 4)?;
        let domains = optional("RELAY_DOMAINS")
            .unwrap_or_else(|| "scan,chat".into())
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                let var = format!("RELAY_SHARD_COUNT_{}", name.to_uppercase());
                Ok(DomainConfig {
                    name: Domain::new(name),
                    shard_count: parsed(&var, default_shards)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        if domains.is_empty() {
            return Err(ConfigError::Invalid {
                var: "RELAY_DOMAINS".into(),
                value: String::new(),
            });
        }

        Ok(RelayConfig {
            streams_url,
            pubsub_url,
            domains,
            consumer_group: optional("RELAY_CONSUMER_GROUP")
                .unwrap_or_else(|| "event-relay".into()),
            consumer_name: optional("RELAY_CONSUMER_NAME").unwrap_or_else(default_consumer_name),
            xread_count: parsed("RELAY_XREAD_COUNT", 100)?,
            xread_block: millis("RELAY_XREAD_BLOCK_MS", 5000)?,
            state_ttl: secs("RELAY_STATE_TTL_SECS", 3600)?,
            marker_ttl: secs("RELAY_MARKER_TTL_SECS", 7200)?,
            reclaim_interval: secs("RELAY_RECLAIM_INTERVAL_SECS", 60)?,
            reclaim_min_idle: millis("RELAY_RECLAIM_MIN_IDLE_MS", 300_000)?,
            queue_capacity: parsed("RELAY_QUEUE_CAPACITY", 100)?,
            keepalive: secs("RELAY_KEEPALIVE_SECS", 15)?,
            state_recheck: secs("RELAY_STATE_RECHECK_SECS", 30)?,
            max_wait: secs("RELAY_MAX_WAIT_SECS", 300)?,
            listen_addr: parsed_with("RELAY_LISTEN_ADDR", "0.0.0.0:3000")?,
        })
    }

    /// Shard count for a domain, `None` if the domain is not served.
    pub fn shard_count(&self, domain: &Domain) -> Option<u32> {
        self.domains
            .iter()
            .find(|d| d.name == *domain)
            .map(|d| d.shard_count)
    }

    /// Every partition key this process consumes, in domain then shard order.
    pub fn stream_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for domain in &self.domains {
            for shard in 0..domain.shard_count {
                keys.push(stream_key(&domain.name, shard));
            }
        }
        keys
    }
}

fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "relay".into());
    format!("{host}-{}", std::process::id())
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match optional(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var: var.to_owned(),
            value: raw,
        }),
    }
}

fn parsed_with<T: std::str::FromStr>(var: &str, default: &str) -> Result<T, ConfigError> {
    let raw = optional(var).unwrap_or_else(|| default.to_owned());
    raw.parse().map_err(|_| ConfigError::Invalid {
        var: var.to_owned(),
        value: raw,
    })
}

fn secs(var: &str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parsed(var, default)?))
}

fn millis(var: &str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parsed(var, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    impl RelayConfig {
        /// Small fixed configuration for tests, independent of the
        /// environment.
        pub fn for_tests() -> Self {
            RelayConfig {
                streams_url: "redis://unused".into(),
                pubsub_url: "redis://unused".into(),
                domains: vec![
                    DomainConfig {
                        name: Domain::new("scan"),
                        shard_count: 2,
                    },
                    DomainConfig {
                        name: Domain::new("chat"),
                        shard_count: 2,
                    },
                ],
                consumer_group: "event-relay".into(),
                consumer_name: "test-consumer".into(),
                xread_count: 10,
                xread_block: Duration::from_millis(10),
                state_ttl: Duration::from_secs(3600),
                marker_ttl: Duration::from_secs(7200),
                reclaim_interval: Duration::from_secs(60),
                reclaim_min_idle: Duration::from_secs(300),
                queue_capacity: 100,
                keepalive: Duration::from_secs(15),
                state_recheck: Duration::from_secs(30),
                max_wait: Duration::from_secs(300),
                listen_addr: "127.0.0.1:0".parse().unwrap(),
            }
        }
    }

    #[test]
    fn stream_keys_cover_every_shard() {
        let config = RelayConfig::for_tests();
        let keys = config.stream_keys();
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&"scan:events:0".to_owned()));
        assert!(keys.contains(&"chat:events:1".to_owned()));
    }

    #[test]
    fn shard_count_is_per_domain() {
        let config = RelayConfig::for_tests();
        assert_eq!(config.shard_count(&Domain::new("scan")), Some(2));
        assert_eq!(config.shard_count(&Domain::new("other")), None);
    }
}
