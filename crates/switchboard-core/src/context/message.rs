use crate::model::event::ToolCallDelta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of a thread's mutable context, the message list presented to
/// the model. Distinct from history messages: entries are mutable in place
/// by `_id`, may be stripped of reasoning once a tool-call loop completes,
/// and the whole list can be overwritten or regenerated from history.
///
/// `extra` keeps any fields plugins attach; keys starting with `_` are
/// internal and stripped from the model-facing form, like `_id` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: ContextRole,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContextMessage {
    pub fn new(role: ContextRole, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            model: None,
            timestamp: None,
            tool_calls: None,
            reasoning_content: None,
            tool_call_id: None,
            extra: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ContextRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ContextRole::Assistant, content)
    }

    pub fn tool_result(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(ContextRole::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Model-facing form: `_id` and any `_`-prefixed extra keys removed.
    pub fn stripped(&self) -> Self {
        let mut clean = self.clone();
        clean.id = None;
        clean.extra.retain(|key, _| !key.starts_with('_'));
        clean
    }

    /// Serialize to a JSON object for storage or the model wire.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
