pub mod event;
pub mod openai;

pub use event::{merge_tool_call_deltas, FunctionDelta, ModelEvent, ToolCallDelta};
pub use openai::OpenAiModelClient;
