//! Core domain types shared across the pipeline.

mod event;
mod ids;

pub use event::{STAGE_DONE, STAGE_TOKEN, STATUS_FAILED, StageEvent};
pub use ids::{Domain, JobId, StreamPosition};
