use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Thinking,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    MessageText,
    ToolUpdate,
}

/// One immutable history message. `aux_id` correlates tool updates with
/// their originating call (or file id, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_id: Option<String>,
}

impl HistoryMessage {
    /// API-facing form: `aux_id` is surfaced as `call_id` for consumers.
    pub fn api_view(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            if let Some(aux) = map.remove("aux_id") {
                map.insert("call_id".to_string(), aux);
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_uses_wire_names() {
        let msg = HistoryMessage {
            role: MessageRole::Tool,
            kind: MessageKind::ToolUpdate,
            content: "done".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            model: None,
            aux_id: Some("c1".to_string()),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], json!("tool"));
        assert_eq!(value["type"], json!("tool_update"));
        assert_eq!(value["aux_id"], json!("c1"));
    }

    #[test]
    fn api_view_renames_aux_id_to_call_id() {
        let msg = HistoryMessage {
            role: MessageRole::Tool,
            kind: MessageKind::ToolUpdate,
            content: "x".to_string(),
            timestamp: "t".to_string(),
            model: None,
            aux_id: Some("c9".to_string()),
        };
        let api = msg.api_view();
        assert_eq!(api["call_id"], json!("c9"));
        assert!(api.get("aux_id").is_none());
    }
}
