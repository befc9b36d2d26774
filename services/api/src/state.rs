//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds everything a relay
//! session needs and is created once at startup.

use crate::{auth::AuthProvider, config::ServerConfig};
use std::sync::Arc;
use voicerag_core::ToolRegistry;

/// The shared application state passed to every relay session.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    /// Base URL of the upstream realtime service.
    pub endpoint: String,
    pub server_config: Arc<ServerConfig>,
    pub tools: Arc<ToolRegistry>,
    pub auth: Arc<AuthProvider>,
}
