//! Axum Router Configuration
//!
//! The gateway exposes a single websocket route. It can either own the whole
//! router or be attached to a host application's router.

use crate::{state::AppState, ws::ws_handler};
use axum::{Router, routing::get};
use std::sync::Arc;

/// Mounts the realtime relay at `path` on an existing router.
pub fn attach_relay<S>(router: Router<S>, path: &str, app_state: Arc<AppState>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let relay = Router::new()
        .route(path, get(ws_handler))
        .with_state(app_state);
    router.merge(relay)
}

/// Creates a router that serves only the realtime relay.
pub fn create_router(app_state: Arc<AppState>, path: &str) -> Router {
    attach_relay(Router::new(), path, app_state)
}
