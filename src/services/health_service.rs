use tracing::warn;

use crate::{dao::storage::with_deadline, dto::health::HealthResponse, state::SharedState};

/// Ping the session store and report whether the service runs degraded.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.session_store().await {
        Some(store) => {
            let deadline = state.config().timings.io_deadline;
            if let Err(err) = with_deadline("health_check", deadline, store.health_check()).await {
                warn!(error = %err, "storage health check failed");
            }
        }
        None => warn!("storage unavailable (degraded mode)"),
    }

    let live_sessions = state.live_session_count();
    if state.is_degraded().await {
        HealthResponse::degraded(live_sessions)
    } else {
        HealthResponse::ok(live_sessions)
    }
}
