// API routes split per domain.
pub mod agents;
pub mod core;
pub mod errors;
pub mod sessions;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(sessions::router())
        .merge(agents::router())
        .merge(core::router())
        .with_state(state)
}
