//! Server-side Tools
//!
//! This module defines the contract every gateway tool satisfies, the result
//! type a tool produces, and the read-only registry a relay session consults
//! when the realtime model asks for a function call.

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::{collections::BTreeMap, future::Future, marker::PhantomData, sync::Arc};

/// Where the content of a tool result is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultDirection {
    /// The text is handed back to the realtime model as the call's output.
    ToServer,
    /// The model receives an empty output; the text goes to the client instead.
    ToClient,
}

/// The outcome of a single tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub text: Value,
    pub destination: ToolResultDirection,
}

impl ToolResult {
    pub fn new(text: impl Into<Value>, destination: ToolResultDirection) -> Self {
        Self {
            text: text.into(),
            destination,
        }
    }

    /// A result whose content is only visible to the realtime model.
    pub fn server(text: impl Into<Value>) -> Self {
        Self::new(text, ToolResultDirection::ToServer)
    }

    /// A result whose content is only visible to the connected client.
    pub fn client(text: impl Into<Value>) -> Self {
        Self::new(text, ToolResultDirection::ToClient)
    }

    /// An empty, server-directed result.
    pub fn empty() -> Self {
        Self::server(Value::Null)
    }

    /// Renders the result text for the wire.
    ///
    /// `null` becomes an empty string, strings are used as-is and any other
    /// JSON value is encoded as compact JSON.
    pub fn to_text(&self) -> String {
        match &self.text {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A capability the realtime model may invoke by name.
///
/// Implementations are owned by a [`ToolRegistry`] and shared read-only
/// across every relay session.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name the model uses to call this tool.
    fn name(&self) -> &str;

    /// The tool definition advertised verbatim to the upstream backend.
    fn schema(&self) -> &Value;

    /// Runs the tool with the parsed JSON arguments of a function call.
    async fn invoke(&self, args: Value) -> Result<ToolResult>;
}

/// Builds a realtime function-tool definition.
pub fn function_schema(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "name": name,
        "description": description,
        "parameters": parameters,
    })
}

/// Generates the JSON schema of `A` for use as function parameters.
pub fn parameters_schema<A: JsonSchema>() -> Result<Value> {
    let mut parameters = serde_json::to_value(schemars::schema_for!(A))
        .context("Failed to serialize tool parameter schema")?;
    if let Some(object) = parameters.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    Ok(parameters)
}

/// Name-indexed set of tools available to every session.
///
/// Ordered by name so that the tool list advertised upstream is stable.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// The definitions of all registered tools, in name order.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.schema().clone()).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

/// A tool backed by an async closure.
pub struct FnTool<F> {
    name: String,
    schema: Value,
    handler: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, schema: Value, handler: F) -> Self {
        Self {
            name: name.into(),
            schema,
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Value {
        &self.schema
    }

    async fn invoke(&self, args: Value) -> Result<ToolResult> {
        (self.handler)(args).await
    }
}

/// A tool whose arguments are deserialized into `A` before the handler runs.
///
/// The advertised parameters are generated from `A`'s JSON schema.
pub struct TypedTool<A, F> {
    name: String,
    schema: Value,
    handler: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F, Fut> TypedTool<A, F>
where
    A: JsonSchema + DeserializeOwned + Send,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, description: &str, handler: F) -> Result<Self> {
        let name = name.into();
        let schema = function_schema(&name, description, parameters_schema::<A>()?);
        Ok(Self {
            name,
            schema,
            handler,
            _args: PhantomData,
        })
    }
}

#[async_trait]
impl<A, F, Fut> Tool for TypedTool<A, F>
where
    A: JsonSchema + DeserializeOwned + Send,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Value {
        &self.schema
    }

    async fn invoke(&self, args: Value) -> Result<ToolResult> {
        let args: A = serde_json::from_value(args)
            .with_context(|| format!("Invalid arguments for tool '{}'", self.name))?;
        (self.handler)(args).await
    }
}
