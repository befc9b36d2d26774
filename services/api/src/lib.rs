//! Realtime Gateway Library Crate
//!
//! This library contains the relay between browser clients and an Azure
//! realtime backend: configuration, upstream authentication, the session
//! transform rules and the websocket plumbing. The `api` binary is a thin
//! wrapper around it.

pub mod auth;
pub mod config;
pub mod router;
pub mod state;
pub mod ws;
