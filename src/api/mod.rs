// HTTP surface: Messenger webhook plus a health check.
pub mod health;
pub mod webhook;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(webhook::router())
        .merge(health::router())
        .with_state(state)
}
