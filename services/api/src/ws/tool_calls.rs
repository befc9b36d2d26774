//! Correlation and execution of function calls requested by the upstream model.

use super::protocol::{ClientNotice, GatewayEvent, Item, OutputItem};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use voicerag_core::{ToolRegistry, ToolResult, ToolResultDirection};

/// A function call announced by the upstream, awaiting its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub call_id: String,
    /// The conversation item that preceded the call.
    pub previous_item_id: Option<String>,
}

/// The function calls of the current response, keyed by call id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingToolCall>>,
}

impl PendingCalls {
    /// Records a call unless its id is already known.
    pub async fn register(&self, call_id: &str, previous_item_id: Option<String>) -> bool {
        let mut calls = self.calls.lock().await;
        if calls.contains_key(call_id) {
            return false;
        }
        calls.insert(
            call_id.to_string(),
            PendingToolCall {
                call_id: call_id.to_string(),
                previous_item_id,
            },
        );
        true
    }

    pub async fn get(&self, call_id: &str) -> Option<PendingToolCall> {
        self.calls.lock().await.get(call_id).cloned()
    }

    /// Forgets every pending call, returning how many there were.
    pub async fn clear(&self) -> usize {
        let mut calls = self.calls.lock().await;
        let count = calls.len();
        calls.clear();
        count
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The messages produced by answering one function call.
#[derive(Debug, Default, PartialEq)]
pub struct ToolCallReply {
    /// The `function_call_output` item for the upstream.
    pub to_upstream: Option<String>,
    /// The tool response notice for the client, if the result is client-visible.
    pub to_client: Option<String>,
}

fn parse_arguments(arguments: Option<&str>) -> Result<Value> {
    match arguments.map(str::trim) {
        None | Some("") => Ok(Value::Object(Default::default())),
        Some(raw) => Ok(serde_json::from_str(raw)?),
    }
}

/// Runs the tool named by a completed function-call item and builds the
/// replies for both sides.
///
/// Unknown tools, unmatched calls and invocation failures never abort the
/// session: the model always gets a `function_call_output` so its response
/// can complete.
#[instrument(skip_all, fields(call_id = tracing::field::Empty, tool = tracing::field::Empty))]
pub async fn answer(tools: &ToolRegistry, pending: &PendingCalls, item: &Item) -> Result<ToolCallReply> {
    let Some(call_id) = item.call_id.as_deref() else {
        // A function_call_output has to name the call it answers, so there is
        // nothing the upstream could match a reply against.
        error!("Function call item has no call_id; the upstream gets no output for it.");
        return Ok(ToolCallReply::default());
    };
    let name = item.name.as_deref().unwrap_or_default();
    let span = tracing::Span::current();
    span.record("call_id", call_id);
    span.record("tool", name);

    let Some(pending_call) = pending.get(call_id).await else {
        warn!("No pending call registered for this call_id; answering with an empty output.");
        return Ok(ToolCallReply {
            to_upstream: Some(function_call_output(call_id, "")?),
            to_client: None,
        });
    };

    let result = match tools.get(name) {
        None => {
            warn!("Upstream requested an unknown tool.");
            ToolResult::empty()
        }
        Some(tool) => match parse_arguments(item.arguments.as_deref()) {
            Err(e) => {
                warn!(error = %e, "Function call arguments are not valid JSON.");
                ToolResult::server(format!("Error: invalid arguments for tool '{}': {}", name, e))
            }
            Ok(args) => match tool.invoke(args).await {
                Ok(result) => {
                    info!(destination = ?result.destination, "Tool call completed.");
                    result
                }
                Err(e) => {
                    warn!(error = ?e, "Tool call failed.");
                    ToolResult::server(format!("Error: tool '{}' failed: {:#}", name, e))
                }
            },
        },
    };

    let text = result.to_text();
    let reply = match result.destination {
        ToolResultDirection::ToServer => ToolCallReply {
            to_upstream: Some(function_call_output(call_id, &text)?),
            to_client: None,
        },
        ToolResultDirection::ToClient => ToolCallReply {
            to_upstream: Some(function_call_output(call_id, "")?),
            to_client: Some(serde_json::to_string(&ClientNotice::ToolResponse {
                previous_item_id: pending_call.previous_item_id.as_deref(),
                tool_name: name,
                tool_result: &text,
            })?),
        },
    };
    Ok(reply)
}

fn function_call_output(call_id: &str, output: &str) -> Result<String> {
    Ok(serde_json::to_string(&GatewayEvent::ConversationItemCreate {
        item: OutputItem::FunctionCallOutput { call_id, output },
    })?)
}
