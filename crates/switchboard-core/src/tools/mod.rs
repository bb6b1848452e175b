pub mod function_tool;
pub mod registry;
pub mod tool;

pub use function_tool::{FunctionTool, ParamKind, ToolParam};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolInvocation};
