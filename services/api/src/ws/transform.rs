//! Rewrite rules applied to every message relayed through a session.
//!
//! Client messages are checked for `session.update`, which gets the
//! server-enforced settings and the gateway's tool list. Upstream messages
//! are filtered so the client never sees the function-calling exchange or the
//! server-side session configuration; completed function calls are executed
//! here and answered on the model's behalf.

use super::{
    protocol::{self, ClientEvent, GatewayEvent, ItemKind, ServerEvent},
    provider::voice_live,
    tool_calls::{self, PendingCalls},
};
use crate::config::{Backend, ServerConfig};
use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;
use voicerag_core::ToolRegistry;

/// What to do with the message that was processed.
#[derive(Debug, PartialEq)]
pub enum Disposition {
    /// Relay the original frame untouched.
    Forward,
    /// Relay this rewritten message instead.
    Replace(String),
    /// Drop the message.
    Suppress,
}

/// The result of processing one upstream message.
#[derive(Debug, PartialEq)]
pub struct Outcome {
    pub disposition: Disposition,
    /// Messages the gateway sends upstream, in order, before relaying.
    pub to_upstream: Vec<String>,
    /// Messages the gateway sends the client, in order, before relaying.
    pub to_client: Vec<String>,
}

impl Outcome {
    fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            to_upstream: Vec::new(),
            to_client: Vec::new(),
        }
    }

    fn forward() -> Self {
        Self::new(Disposition::Forward)
    }

    fn suppress() -> Self {
        Self::new(Disposition::Suppress)
    }
}

/// Per-session message processor.
///
/// Owns the session's pending function calls; the tool registry and the
/// server configuration are shared with every other session.
pub struct MessageProcessor {
    config: Arc<ServerConfig>,
    tools: Arc<ToolRegistry>,
    pending: PendingCalls,
}

impl MessageProcessor {
    pub fn new(config: Arc<ServerConfig>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            config,
            tools,
            pending: PendingCalls::default(),
        }
    }

    fn voice(&self) -> Value {
        match (&self.config.voice_choice, self.config.backend) {
            (None, _) => Value::Null,
            (Some(voice), Backend::VoiceLive) => voice_live::voice(voice),
            (Some(voice), Backend::Realtime) => Value::String(voice.clone()),
        }
    }

    /// Applies the client → upstream rules to one text frame.
    pub fn process_to_server(&self, text: &str) -> Result<Disposition> {
        if !protocol::event_type(text).is_some_and(|kind| ClientEvent::is_handled(&kind)) {
            return Ok(Disposition::Forward);
        }
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(ClientEvent::SessionUpdate) => self.enforce_session(text).map(Disposition::Replace),
            Ok(ClientEvent::Other) => Ok(Disposition::Forward),
            Err(e) => {
                debug!(error = %e, "Relaying unparsable client message as-is.");
                Ok(Disposition::Forward)
            }
        }
    }

    fn enforce_session(&self, text: &str) -> Result<String> {
        let mut message: Value = serde_json::from_str(text)?;
        let object = message
            .as_object_mut()
            .context("session.update is not a JSON object")?;
        if !object.get("session").is_some_and(Value::is_object) {
            object.insert("session".into(), Value::Object(Map::new()));
        }
        let session = object
            .get_mut("session")
            .and_then(Value::as_object_mut)
            .context("session.update has no session object")?;

        let config = &self.config;
        if let Some(system_message) = &config.system_message {
            session.insert("instructions".into(), json!(system_message));
        }
        if let Some(temperature) = config.temperature {
            session.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = config.max_tokens {
            session.insert("max_response_output_tokens".into(), json!(max_tokens));
        }
        if let Some(disable_audio) = config.disable_audio {
            session.insert("disable_audio".into(), json!(disable_audio));
        }
        if config.voice_choice.is_some() {
            session.insert("voice".into(), self.voice());
        }
        let tool_choice = if self.tools.is_empty() { "none" } else { "auto" };
        session.insert("tool_choice".into(), json!(tool_choice));
        session.insert("tools".into(), Value::Array(self.tools.schemas()));

        if config.backend == Backend::VoiceLive {
            voice_live::apply_session_defaults(session, config.model.as_deref().unwrap_or_default());
        }

        debug!(tool_choice, tools = self.tools.len(), "Enforced server session settings.");
        Ok(serde_json::to_string(&message)?)
    }

    /// Applies the upstream → client rules to one text frame, running any
    /// tool the frame completes.
    pub async fn process_to_client(&self, text: &str) -> Result<Outcome> {
        if !protocol::event_type(text).is_some_and(|kind| ServerEvent::is_handled(&kind)) {
            return Ok(Outcome::forward());
        }
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Relaying unrecognized upstream message as-is.");
                return Ok(Outcome::forward());
            }
        };

        match event {
            ServerEvent::SessionCreated => self
                .redact_session(text)
                .map(|redacted| Outcome::new(Disposition::Replace(redacted))),
            ServerEvent::TranscriptionCompleted { transcript } => {
                debug!(transcript = transcript.as_deref().unwrap_or_default(), "Input transcribed.");
                Ok(Outcome::forward())
            }
            ServerEvent::TranscriptionDelta { delta } => {
                debug!(delta = delta.as_deref().unwrap_or_default(), "Partial transcript.");
                Ok(Outcome::forward())
            }
            ServerEvent::OutputItemAdded { item: Some(item) } if item.is_function_call() => {
                Ok(Outcome::suppress())
            }
            ServerEvent::ConversationItemCreated {
                item: Some(item),
                previous_item_id,
            } => {
                if item.is_function_call() {
                    match item.call_id.as_deref() {
                        Some(call_id) => {
                            if self.pending.register(call_id, previous_item_id).await {
                                debug!(call_id, "Registered pending function call.");
                            }
                        }
                        None => debug!("Function call item without call_id."),
                    }
                    Ok(Outcome::suppress())
                } else if item.kind == ItemKind::FunctionCallOutput {
                    Ok(Outcome::suppress())
                } else {
                    Ok(Outcome::forward())
                }
            }
            ServerEvent::FunctionCallArgumentsDelta | ServerEvent::FunctionCallArgumentsDone => {
                Ok(Outcome::suppress())
            }
            ServerEvent::OutputItemDone { item: Some(item) } if item.is_function_call() => {
                let reply = tool_calls::answer(&self.tools, &self.pending, &item).await?;
                let mut outcome = Outcome::suppress();
                outcome.to_upstream.extend(reply.to_upstream);
                outcome.to_client.extend(reply.to_client);
                Ok(outcome)
            }
            ServerEvent::ResponseDone => self.complete_response(text).await,
            _ => Ok(Outcome::forward()),
        }
    }

    /// Hides the server-side session configuration from the client.
    fn redact_session(&self, text: &str) -> Result<String> {
        let mut message: Value = serde_json::from_str(text)?;
        if let Some(session) = message.get_mut("session").and_then(Value::as_object_mut) {
            session.insert("instructions".into(), json!(""));
            session.insert("tools".into(), json!([]));
            session.insert("voice".into(), self.voice());
            session.insert("tool_choice".into(), json!("none"));
            session.insert("max_response_output_tokens".into(), Value::Null);
        }
        Ok(serde_json::to_string(&message)?)
    }

    async fn complete_response(&self, text: &str) -> Result<Outcome> {
        let mut outcome = Outcome::forward();
        let answered = self.pending.clear().await;
        if answered > 0 {
            debug!(answered, "Requesting a follow-up response after tool calls.");
            outcome
                .to_upstream
                .push(serde_json::to_string(&GatewayEvent::ResponseCreate)?);
        }

        let mut message: Value = serde_json::from_str(text)?;
        let removed = match message
            .pointer_mut("/response/output")
            .and_then(Value::as_array_mut)
        {
            Some(output) => {
                let before = output.len();
                output.retain(|entry| entry.get("type").and_then(Value::as_str) != Some("function_call"));
                before - output.len()
            }
            None => 0,
        };
        if removed > 0 {
            outcome.disposition = Disposition::Replace(serde_json::to_string(&message)?);
        }
        Ok(outcome)
    }
}
