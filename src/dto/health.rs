use serde::Serialize;
use utoipa::ToSchema;

/// Health payload returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Number of sessions currently held by the hub.
    pub live_sessions: usize,
}

impl HealthResponse {
    /// The session store is connected and answering.
    pub fn ok(live_sessions: usize) -> Self {
        Self {
            status: "ok".to_string(),
            live_sessions,
        }
    }

    /// The session store is missing or failing.
    pub fn degraded(live_sessions: usize) -> Self {
        Self {
            status: "degraded".to_string(),
            live_sessions,
        }
    }
}
