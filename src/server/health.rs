//! Liveness probe with basic fan-out gauges.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    /// Currently connected subscriber queues.
    pub subscribers: usize,
    /// Active per-job fan-out listeners.
    pub listeners: usize,
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthBody> {
    let (subscribers, listeners) = state.manager().counts();
    Json(HealthBody {
        status: "ok",
        subscribers,
        listeners,
    })
}
