//! Event Relay - real-time distribution of job stage events.
//!
//! Consumes a sharded durable log of producer events, applies each one to a
//! per-job state snapshot exactly once, fans it out over pub/sub, and serves
//! long-lived per-job SSE streams with reconnect catch-up.

pub mod backend;
pub mod config;
pub mod gateway;
pub mod router;
pub mod server;
pub mod sharding;
pub mod types;
