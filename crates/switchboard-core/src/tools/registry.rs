use crate::tools::tool::Tool;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Registry of callable tools. Tool names are unique across the build: the
/// first registration of a name wins and later duplicates are skipped with
/// a warning.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!("duplicate tool name '{name}' skipped; first registration wins");
            return;
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Aggregated schema list in OpenAI function-call format, name-sorted.
    pub fn schemas(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::tools::tool::ToolInvocation;
    use async_trait::async_trait;

    struct EchoTool {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _invocation: ToolInvocation) -> Bridge<Value> {
            Bridge::ready(json!(self.reply))
        }
    }

    #[tokio::test]
    async fn first_registration_wins_on_duplicate_names() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { name: "echo", reply: "first" }));
        registry.register(Arc::new(EchoTool { name: "echo", reply: "second" }));

        let tool = registry.get("echo").unwrap();
        let result = tool
            .execute(ToolInvocation {
                user_id: "u".into(),
                thread_id: "t".into(),
                turn_correlation_id: "c".into(),
                arguments: json!({}),
            })
            .await
            .returns()
            .await
            .unwrap();
        assert_eq!(result, json!("first"));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn schemas_are_name_sorted_openai_shape() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { name: "zulu", reply: "z" }));
        registry.register(Arc::new(EchoTool { name: "alpha", reply: "a" }));

        let schemas = registry.schemas();
        assert_eq!(schemas[0]["function"]["name"], json!("alpha"));
        assert_eq!(schemas[1]["function"]["name"], json!("zulu"));
        assert_eq!(schemas[0]["type"], json!("function"));
    }
}
