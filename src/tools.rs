//! Tool implementations shared by every agent runtime.
//!
//! Stateless tools with context injection: each call receives a fresh
//! `ToolContext` rather than holding a reference to the owning agent.

mod bash;
mod keyword_search;
pub mod patch;
mod read_image;
mod think;

pub use bash::BashTool;
pub use keyword_search::KeywordSearchTool;
pub use patch::PatchTool;
pub use read_image::ReadImageTool;
pub use think::ThinkTool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::llm::ModelRegistry;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each tool call with validated conversation context.
/// Tools should be stateless and derive all context from this struct.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,

    /// The agent this tool is executing within
    pub conversation_id: String,

    /// Working directory for file operations
    pub working_dir: PathBuf,

    /// LLM registry for tools that need model access
    llm_registry: Arc<ModelRegistry>,
}

impl ToolContext {
    /// Create a new tool context
    pub fn new(
        cancel: CancellationToken,
        conversation_id: String,
        working_dir: PathBuf,
        llm_registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            cancel,
            conversation_id,
            working_dir,
            llm_registry,
        }
    }

    /// Get the LLM registry
    pub fn llm_registry(&self) -> &Arc<ModelRegistry> {
        &self.llm_registry
    }
}

/// Trait for tools that can be executed by the agent
///
/// REQ-BASH-010, REQ-BT-012: Tools are stateless - all context via `ToolContext`
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool with all context provided via `ToolContext`
    ///
    /// Tools that spawn long-running subprocesses should monitor
    /// ctx.cancel and terminate gracefully when cancelled.
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Collection of tools available to conversations
///
/// Stateless - tools are singletons, all per-call context via `ToolContext`
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create standard tool registry (parent conversations)
    pub fn standard() -> Self {
        Self::new_with_options(false)
    }

    /// Create tool registry for sub-agents (different tool set)
    pub fn for_subagent() -> Self {
        Self::new_with_options(true)
    }

    /// Create tool registry with options. Worker and manager archetypes get
    /// the same tool set; archetype-specific behavior lives in the system
    /// prompt (see `archetype`), not in tool availability.
    fn new_with_options(_is_sub_agent: bool) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ThinkTool),
            Arc::new(BashTool),
            Arc::new(PatchTool::default()),
            Arc::new(KeywordSearchTool),
            Arc::new(ReadImageTool),
        ];

        Self { tools }
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name with context
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tools_registered() {
        let registry = ToolRegistry::standard();
        let defs = registry.definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();

        for expected in ["think", "bash", "patch", "keyword_search", "read_image"] {
            assert!(names.contains(&expected), "Missing {expected}");
        }
    }

    #[test]
    fn test_subagent_tools_match_standard() {
        assert_eq!(
            ToolRegistry::standard().definitions().len(),
            ToolRegistry::for_subagent().definitions().len()
        );
    }
}
