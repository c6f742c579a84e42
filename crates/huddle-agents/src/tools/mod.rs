pub mod http;

use async_trait::async_trait;
use huddle_common::{Error, Result, UserContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::providers::ToolDescriptor;

pub use http::HttpTool;

/// Per-call context handed to tools.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    pub user: UserContext,
    /// Cancelled when the owning turn is aborted.
    pub cancel: CancellationToken,
}

/// Text result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A platform wrapper the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Globally unique name.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema the call arguments must satisfy.
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(&self, context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput>;
}

/// Ordered set of uniquely named tools offered to the model for one turn.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tools(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Result<Self> {
        let mut catalog = Self::new();
        for tool in tools {
            catalog.register(tool)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        if self.get(tool.name()).is_some() {
            return Err(Error::Agent(format!(
                "tool '{}' is already registered",
                tool.name()
            )));
        }
        info!("registered tool: {}", tool.name());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
