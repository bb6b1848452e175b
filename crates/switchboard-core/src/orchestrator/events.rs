use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single user submission; one turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Events streamed to the caller over the course of one turn. Model-side
/// `tool_calls` events are internal and never forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TurnEvent {
    ThreadId {
        thread_id: String,
        timestamp: String,
    },
    ThinkingTokens {
        content: String,
        timestamp: String,
        model: String,
    },
    MessageTokens {
        content: String,
        timestamp: String,
        model: String,
    },
    ToolUpdate {
        call_id: String,
        content: String,
        timestamp: String,
    },
    StreamEnd {
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl TurnEvent {
    pub fn thread_id(thread_id: impl Into<String>) -> Self {
        Self::ThreadId {
            thread_id: thread_id.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn thinking(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self::ThinkingTokens {
            content: content.into(),
            timestamp: now_rfc3339(),
            model: model.into(),
        }
    }

    pub fn message(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self::MessageTokens {
            content: content.into(),
            timestamp: now_rfc3339(),
            model: model.into(),
        }
    }

    pub fn tool_update(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolUpdate {
            call_id: call_id.into(),
            content: content.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn stream_end() -> Self {
        Self::StreamEnd {
            timestamp: now_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_matches_event_alphabet() {
        let event = TurnEvent::tool_update("c1", "🔧 Calling ping({})");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "tool_update");
        assert_eq!(value["data"]["call_id"], "c1");
        assert!(value["data"]["timestamp"].is_string());
    }
}
