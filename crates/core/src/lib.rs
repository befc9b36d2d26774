//! Tool contract and registry shared by the realtime gateway.

pub mod mcp;
pub mod tool;

pub use tool::{FnTool, Tool, ToolRegistry, ToolResult, ToolResultDirection, TypedTool};
