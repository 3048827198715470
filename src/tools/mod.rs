//! Tools the model can call during a response
//!
//! Each tool advertises a function schema in `session.update`. When the model
//! finishes a `function_call` item the runtime executes it off the voice
//! loop and sends the JSON result back.

mod search;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

pub use search::{SearchProvider, SearchResult, WebSearchTool};

use crate::config::ToolsConfig;
use crate::realtime::ToolRequest;
use crate::{Error, Result};

/// A function the model can call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name as the model sees it
    fn name(&self) -> &str;

    /// Function schema advertised to the model
    fn schema(&self) -> Value;

    /// Run the tool with parsed arguments
    async fn call(&self, arguments: Value) -> Result<Value>;
}

/// Registered tools by name
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool whose credentials are configured
    #[must_use]
    pub fn from_config(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();

        match WebSearchTool::from_keys(
            config.google_api_key.as_deref(),
            config.google_search_cx.as_deref(),
            config.serper_api_key.as_deref(),
        ) {
            Some(search) => registry.register(search),
            None => tracing::info!("no search credentials, web search disabled"),
        }

        registry
    }

    /// Add a tool, replacing any with the same name
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Schemas for `session.update`
    #[must_use]
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(|tool| tool.schema()).collect()
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a request and encode the result for `function_call_output`
    ///
    /// Failures are reported to the model as `{"error": ...}` rather than
    /// propagated, so the conversation can continue.
    pub async fn execute(&self, request: &ToolRequest) -> String {
        let output = match self.call(request).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tool = %request.name, error = %e, "tool call failed");
                json!({ "error": e.to_string() })
            }
        };
        output.to_string()
    }

    async fn call(&self, request: &ToolRequest) -> Result<Value> {
        let tool = self
            .tools
            .get(&request.name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {}", request.name)))?;

        let arguments: Value = serde_json::from_str(&request.arguments)
            .map_err(|e| Error::Tool(format!("invalid arguments for {}: {e}", request.name)))?;

        tracing::debug!(tool = %request.name, "executing tool");
        tool.call(arguments).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn schema(&self) -> Value {
            json!({"type": "function", "name": "echo"})
        }

        async fn call(&self, arguments: Value) -> Result<Value> {
            Ok(arguments)
        }
    }

    fn request(name: &str, arguments: &str) -> ToolRequest {
        ToolRequest {
            name: name.to_string(),
            call_id: "call_1".to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[tokio::test]
    async fn test_execute_known_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);

        let output = registry.execute(&request("echo", r#"{"a":1}"#)).await;
        assert_eq!(output, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_reports_error() {
        let registry = ToolRegistry::new();
        let output = registry.execute(&request("missing", "{}")).await;

        let value: Value = serde_json::from_str(&output).unwrap();
        assert!(value["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_execute_bad_arguments_reports_error() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);

        let output = registry.execute(&request("echo", "not json")).await;
        let value: Value = serde_json::from_str(&output).unwrap();
        assert!(value["error"].is_string());
    }

    #[test]
    fn test_from_config_without_keys() {
        let registry = ToolRegistry::from_config(&ToolsConfig::default());
        assert!(registry.is_empty());
        assert!(registry.schemas().is_empty());
    }

    #[test]
    fn test_from_config_with_serper() {
        let config = ToolsConfig {
            serper_api_key: Some("key".to_string()),
            ..ToolsConfig::default()
        };
        let registry = ToolRegistry::from_config(&config);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.schemas()[0]["name"], "webSearch");
    }
}
