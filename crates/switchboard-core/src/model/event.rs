use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Partial function payload of a streamed tool call. `arguments` arrives as
/// text fragments that are concatenated across deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One streamed tool-call fragment. Fragments that share an `index` belong
/// to the same call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

/// Events streamed by a model plugin for a single round.
///
/// A conforming stream emits thinking tokens before matching message tokens
/// of the same round, forwards tool-call fragments as they arrive, finishes
/// with exactly one `StreamEnd` carrying metadata (which may include final
/// tool_calls, usage, and a provider message id), and on failure emits
/// `Error` and stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ModelEvent {
    ThinkingTokens { content: String },
    MessageTokens { content: String },
    ToolCalls { calls: Vec<ToolCallDelta> },
    StreamEnd { metadata: Value },
    Error { message: String },
}

/// Merge an incoming fragment into the accumulated list by `index`:
/// `function.arguments` concatenates, every other field overwrites.
pub fn merge_tool_call_deltas(accumulated: &mut Vec<ToolCallDelta>, incoming: &ToolCallDelta) {
    if let Some(existing) = accumulated.iter_mut().find(|c| c.index == incoming.index) {
        if let Some(new_fn) = &incoming.function {
            let merged = existing.function.get_or_insert_with(FunctionDelta::default);
            if let Some(name) = &new_fn.name {
                merged.name = Some(name.clone());
            }
            if let Some(fragment) = &new_fn.arguments {
                match &mut merged.arguments {
                    Some(existing_args) => existing_args.push_str(fragment),
                    None => merged.arguments = Some(fragment.clone()),
                }
            }
        }
        if let Some(id) = &incoming.id {
            existing.id = Some(id.clone());
        }
        if let Some(kind) = &incoming.kind {
            existing.kind = Some(kind.clone());
        }
    } else {
        accumulated.push(incoming.clone());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
