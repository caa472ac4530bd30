//! The delivery side of the pipeline: one fan-out listener per watched job,
//! one bounded queue per connected client, catch-up reads against the
//! durable log for anything pub/sub lost, and a token recovery path for
//! chat streams.

mod catchup;
mod manager;
mod queue;
mod tokens;


pub use manager::{BroadcastManager, EventStream, StreamFrame, SubscribeParams};
pub use queue::{PutResult, SubscriberQueue};
pub use tokens::TokenRecovery;
