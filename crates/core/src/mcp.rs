//! MCP-backed Tools
//!
//! Exposes the tools of a running MCP server as gateway [`Tool`]s so that the
//! realtime model can call them through the relay.

use crate::tool::{Tool, ToolRegistry, ToolResult, ToolResultDirection, function_schema};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};
use tracing::{info, instrument};

/// A connected MCP client shared by every tool it provides.
pub type McpClient = Arc<RunningService<RoleClient, ()>>;

/// A single tool provided by an MCP server.
pub struct McpTool {
    client: McpClient,
    name: String,
    schema: Value,
    destination: ToolResultDirection,
}

impl McpTool {
    pub fn new(
        client: McpClient,
        name: String,
        schema: Value,
        destination: ToolResultDirection,
    ) -> Self {
        Self {
            client,
            name,
            schema,
            destination,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Value {
        &self.schema
    }

    #[instrument(skip_all, fields(tool = %self.name))]
    async fn invoke(&self, args: Value) -> Result<ToolResult> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => bail!("Tool arguments must be a JSON object, got {}", other),
        };

        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: self.name.clone().into(),
                arguments,
            })
            .await
            .with_context(|| format!("MCP call to '{}' failed", self.name))?;

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .find_map(|content| match content.raw {
                RawContent::Text(text_content) => Some(text_content.text),
                _ => None,
            })
            .unwrap_or_default();

        if result.is_error.unwrap_or(false) {
            return Err(anyhow!("Tool '{}' reported an error: {}", self.name, text));
        }
        Ok(ToolResult::new(text, self.destination))
    }
}

/// Lists an MCP server's tools and registers each of them.
///
/// Tools named in `client_visible` deliver their results to the client; all
/// others deliver to the realtime model.
pub async fn register_tools(
    client: McpClient,
    client_visible: &HashSet<String>,
    registry: &mut ToolRegistry,
) -> Result<usize> {
    let tools = client
        .list_all_tools()
        .await
        .context("Failed to list MCP tools")?;

    let count = tools.len();
    for t in tools {
        let name = t.name.to_string();
        let parameters = serde_json::to_value(&*t.input_schema)?;
        let schema = function_schema(
            &name,
            &t.description.unwrap_or_default(),
            parameters,
        );
        let destination = if client_visible.contains(&name) {
            ToolResultDirection::ToClient
        } else {
            ToolResultDirection::ToServer
        };
        info!(tool = %name, ?destination, "Registered MCP tool");
        registry.register(Arc::new(McpTool::new(
            client.clone(),
            name,
            schema,
            destination,
        )));
    }
    Ok(count)
}
