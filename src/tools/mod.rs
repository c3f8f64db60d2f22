//! Tool System module.
//!
//! This module defines the `Tool` trait, the `FunctionRegistry` seam the
//! dispatcher calls through, and `ToolRouter`, the default registry.
//!
//! Key concepts:
//! - **Tool trait**: every app function implements this trait, providing its
//!   name, description, JSON Schema for parameters, and an execute method
//! - **FunctionRegistry**: lookup by name, injected into the dispatcher so
//!   the core never reaches for global app tables
//! - **ToolRouter**: a registry that holds all registered tools

pub mod dispatcher;

pub use dispatcher::{dispatch, parse_arguments, ToolResult};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::ToolDefinition;

/// Keyword arguments passed to a tool.
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// Trait that all tools must implement.
///
/// Tools receive keyword arguments and return a string result that is sent
/// back to the LLM as the tool message content.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "run_code").
    fn name(&self) -> &str;

    /// A human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's input parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given keyword arguments.
    async fn execute(&self, args: ToolArgs) -> Result<String>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// Name-based lookup of callable functions.
pub trait FunctionRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<&dyn Tool>;

    /// Definitions offered to the model when tools are enabled.
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// Holds the registered tools and resolves them by name.
pub struct ToolRouter {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRouter {
    /// Create a new empty ToolRouter.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. A later registration with the same name replaces the
    /// earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    /// Check if a tool with the given name is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry for ToolRouter {
    fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }
}
