pub mod function;
pub mod registry;
pub mod roles;

pub use function::{CallSettings, FunctionFanOut, FunctionPlugin, HookContext, PreCallState};
pub use registry::PluginRegistry;
pub use roles::{
    AuthenticatedUser, AuthPlugin, ContextPlugin, MessageProcessorPlugin, ModelPlugin, Role,
    RoleInstance, StorePlugin, SystemPromptPlugin, ThreadPlugin,
};
