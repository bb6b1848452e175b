pub mod auth;
pub mod bridge;
pub mod config;
pub mod context;
pub mod model;
pub mod orchestrator;
pub mod plugins;
pub mod prompts;
pub mod store;
pub mod system;
pub mod threads;
pub mod tools;

pub use auth::auth::YamlFileAuth;
pub use bridge::bridge::{Bridge, Emitter};
pub use config::config::AppConfig;
pub use context::manager::ContextManager;
pub use context::message::{ContextMessage, ContextRole};
pub use model::event::{FunctionDelta, ModelEvent, ToolCallDelta};
pub use model::openai::OpenAiModelClient;
pub use orchestrator::events::{TurnEvent, TurnRequest};
pub use orchestrator::orchestrator::TurnOrchestrator;
pub use plugins::function::{
    CallSettings, FunctionFanOut, FunctionPlugin, HookContext, PreCallState,
};
pub use plugins::registry::PluginRegistry;
pub use plugins::roles::{
    AuthenticatedUser, AuthPlugin, ContextPlugin, MessageProcessorPlugin, ModelPlugin, Role,
    RoleInstance, StorePlugin, SystemPromptPlugin, ThreadPlugin,
};
pub use prompts::prompts::YamlSystemPrompts;
pub use store::admin::StoreExport;
pub use store::error::StoreError;
pub use store::query::{FilterCondition, FilterOp, Filters, FindQuery, Page};
pub use store::store::SqliteStore;
pub use store::value::{FieldType, StoreSchema};
pub use system::System;
pub use threads::manager::{ThreadManager, ThreadSearchHit, ThreadSummary};
pub use threads::message::{HistoryMessage, MessageKind, MessageRole};
pub use tools::function_tool::{FunctionTool, ParamKind, ToolParam};
pub use tools::registry::ToolRegistry;
pub use tools::tool::{Tool, ToolInvocation};
