use crate::bridge::Bridge;
use async_trait::async_trait;
use serde_json::Value;

/// One tool execution request. The correlation id is shared by every hook
/// and tool call of the turn.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub user_id: String,
    pub thread_id: String,
    pub turn_correlation_id: String,
    pub arguments: Value,
}

/// A tool the model can call. `execute` returns a [`Bridge`] so a tool may
/// stream progress updates to the user before producing its result; a tool
/// with nothing to report wraps its result with `Bridge::ready` or
/// `Bridge::from_future`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the tool's parameters.
    fn parameters(&self) -> Value;
    async fn execute(&self, invocation: ToolInvocation) -> Bridge<Value>;
}
