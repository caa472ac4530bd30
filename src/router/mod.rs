//! The routing side of the pipeline: consume partitions of the durable log,
//! run each entry through the atomic state transition, and fan the result
//! out over pub/sub. One [`ShardConsumer`] per process handles the live
//! path; one [`PendingReclaimer`] sweeps up deliveries that died between
//! read and acknowledgement.

mod consumer;
mod processor;
mod reclaimer;

#[cfg(test)]
mod tests;

pub use consumer::ShardConsumer;
pub use processor::{EventProcessor, Outcome, ProcessorError};
pub use reclaimer::PendingReclaimer;
