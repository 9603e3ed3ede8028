use axum::Router;

use crate::state::SharedState;

pub mod auth;
pub mod docs;
pub mod health;
pub mod live;

/// Compose the health, live session and documentation routes over the shared state.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(live::router())
        .merge(docs::router())
        .with_state(state)
}
