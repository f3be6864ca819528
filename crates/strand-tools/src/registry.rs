use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Immutable registry of available tools.
///
/// Built once through [`ToolRegistryBuilder`] and shared behind `Arc`;
/// per-run variations (enabled subsets, remote tools) are new registries
/// that share the same tool instances.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

/// Collects tools before freezing them into a [`ToolRegistry`].
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Register a tool. A later tool with the same name replaces the earlier one.
    pub fn register(mut self, tool: impl Tool) -> Self {
        self.insert(Arc::new(tool));
        self
    }

    /// Register an already shared tool.
    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.insert(tool);
        self
    }

    fn insert(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Tool registered twice, keeping the latest");
        }
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        crate::builtin::register_all(Self::builder()).build()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for sending to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// A registry holding only the named tools. An empty list keeps everything.
    /// Unknown names are logged and skipped.
    pub fn subset(&self, names: &[String]) -> ToolRegistry {
        if names.is_empty() {
            return self.clone();
        }
        let mut tools = BTreeMap::new();
        for name in names {
            match self.tools.get(name) {
                Some(tool) => {
                    tools.insert(name.clone(), tool.clone());
                }
                None => warn!(tool = %name, "Enabled tool is not registered"),
            }
        }
        ToolRegistry { tools }
    }

    /// A registry extended with extra tools. Existing names win.
    pub fn extended(&self, extra: impl IntoIterator<Item = Arc<dyn Tool>>) -> ToolRegistry {
        let mut tools = self.tools.clone();
        for tool in extra {
            let name = tool.name().to_string();
            if tools.contains_key(&name) {
                warn!(tool = %name, "Remote tool shadows a local tool, ignoring it");
                continue;
            }
            tools.insert(name, tool);
        }
        ToolRegistry { tools }
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| StrandError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(StrandError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::types::RunId;
    use strand_test_utils::FnTool;

    fn ctx() -> ToolContext {
        ToolContext::new(RunId::new())
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        for name in ["calc", "echo", "get_current_datetime", "web_page_reader"] {
            assert!(registry.contains(name), "missing builtin {}", name);
        }
        assert_eq!(registry.definitions().len(), registry.len());
    }

    #[test]
    fn test_subset_and_extended() {
        let registry = ToolRegistry::builder()
            .register(FnTool::constant("a", "1"))
            .register(FnTool::constant("b", "2"))
            .build();

        let only_a = registry.subset(&["a".to_string(), "missing".to_string()]);
        assert_eq!(only_a.list(), vec!["a"]);
        assert_eq!(registry.subset(&[]).len(), 2);

        let extra: Arc<dyn Tool> = Arc::new(FnTool::constant("c", "3"));
        let shadow: Arc<dyn Tool> = Arc::new(FnTool::constant("a", "remote"));
        let extended = only_a.extended(vec![extra, shadow]);
        assert_eq!(extended.list(), vec!["a", "c"]);
        // The original is untouched.
        assert_eq!(only_a.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::ToolNotFound(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn test_execute_returns_tool_output() {
        let tool = FnTool::new("upper", |input| {
            Ok(input["text"].as_str().unwrap_or_default().to_uppercase())
        });
        let calls = tool.counter();
        let registry = ToolRegistry::builder().register(tool).build();
        let result = registry
            .execute("upper", serde_json::json!({"text": "hi"}), ctx())
            .await
            .unwrap();
        assert_eq!(result.content, "HI");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
