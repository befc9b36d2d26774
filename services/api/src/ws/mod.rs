//! Realtime Relay
//!
//! Everything that happens on a relayed websocket connection:
//!
//! - `protocol`: the realtime events the gateway recognizes or synthesizes.
//! - `provider`: opening the upstream connection for each backend.
//! - `transform`: rewriting, redacting and suppressing messages in both directions.
//! - `tool_calls`: running tools the model calls and answering it.
//! - `session`: the connection lifecycle and the two forwarding loops.

pub mod protocol;
pub mod provider;
pub mod session;
pub mod tool_calls;
pub mod transform;

pub use session::ws_handler;
