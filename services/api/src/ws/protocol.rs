//! The subset of the realtime protocol the gateway recognizes.
//!
//! Incoming events are classified by their `type` tag into closed enums with
//! an explicit catch-all; everything the gateway does not act on falls into
//! `Other` and is relayed verbatim. Outgoing events are the few messages the
//! gateway synthesizes itself.
//!
//! Most traffic is audio deltas and appends. [`event_type`] reads only the
//! tag so those frames are never parsed into a full event.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Deserialize)]
struct EventTag<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
}

/// Reads the `type` tag of a JSON event, skipping over every other field.
pub fn event_type(text: &str) -> Option<Cow<'_, str>> {
    serde_json::from_str::<EventTag>(text).ok().map(|tag| tag.kind)
}

/// Events sent by the client that the gateway rewrites.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate,
    #[serde(other)]
    Other,
}

impl ClientEvent {
    /// Whether frames with this tag need the full parse.
    pub fn is_handled(kind: &str) -> bool {
        kind == "session.update"
    }
}

/// Events sent by the upstream API that the gateway inspects.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        item: Option<Item>,
    },
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        item: Option<Item>,
        #[serde(default)]
        previous_item_id: Option<String>,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta,
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone,
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        item: Option<Item>,
    },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Tags of every variant other than `Other`.
    pub const HANDLED: &[&str] = &[
        "session.created",
        "conversation.item.input_audio_transcription.completed",
        "conversation.item.input_audio_transcription.delta",
        "response.output_item.added",
        "conversation.item.created",
        "response.function_call_arguments.delta",
        "response.function_call_arguments.done",
        "response.output_item.done",
        "response.done",
    ];

    /// Whether frames with this tag need the full parse.
    pub fn is_handled(kind: &str) -> bool {
        Self::HANDLED.contains(&kind)
    }
}

/// The fields of a conversation item the gateway needs.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Item {
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl Item {
    pub fn is_function_call(&self) -> bool {
        self.kind == ItemKind::FunctionCall
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    FunctionCall,
    FunctionCallOutput,
    #[default]
    #[serde(other)]
    Other,
}

/// Events the gateway sends to the upstream API on its own behalf.
#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub enum GatewayEvent<'a> {
    /// Supplies the output of a function call.
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: OutputItem<'a> },
    /// Asks the model to continue now that tool outputs are available.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem<'a> {
    FunctionCallOutput { call_id: &'a str, output: &'a str },
}

/// Events the gateway sends to the client on its own behalf.
#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub enum ClientNotice<'a> {
    /// Carries a client-visible tool result.
    #[serde(rename = "extension.middle_tier_tool_response")]
    ToolResponse {
        previous_item_id: Option<&'a str>,
        tool_name: &'a str,
        tool_result: &'a str,
    },
}
