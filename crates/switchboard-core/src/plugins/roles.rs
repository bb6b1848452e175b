use crate::context::message::ContextMessage;
use crate::model::event::ModelEvent;
use crate::orchestrator::events::{TurnEvent, TurnRequest};
use crate::store::crud::Record;
use crate::store::error::StoreError;
use crate::store::query::{Filters, FindQuery, Page};
use crate::store::value::StoreSchema;
use crate::threads::manager::{ThreadSearchHit, ThreadSummary};
use crate::threads::message::{HistoryMessage, MessageKind, MessageRole};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The closed set of capability slots the system requires. Each role has
/// exactly one active plugin after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Auth,
    Model,
    Thread,
    Store,
    Context,
    SystemPrompt,
    MessageProcessor,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Auth,
        Role::Model,
        Role::Thread,
        Role::Store,
        Role::Context,
        Role::SystemPrompt,
        Role::MessageProcessor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Auth => "auth",
            Role::Model => "model",
            Role::Thread => "thread",
            Role::Store => "store",
            Role::Context => "context",
            Role::SystemPrompt => "system_prompt",
            Role::MessageProcessor => "message_processor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub username: String,
    pub role: String,
}

/// Authentication capability.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn authenticate_user(&self, username: &str, password: &str)
        -> Option<AuthenticatedUser>;
    fn create_token(&self, user: &AuthenticatedUser) -> Result<String>;
    fn verify_token(&self, token: &str) -> Option<String>;
    /// Request-level authorization (quota, model allow-lists, …).
    fn request_allowed(&self, username: &str, model: &str) -> bool;
}

/// Streaming model capability. The plugin owns connection and retry to the
/// underlying provider; the orchestrator treats the stream as opaque.
#[async_trait]
pub trait ModelPlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn available_models(&self) -> Result<Vec<String>>;
    async fn generate_response(
        &self,
        messages: Vec<ContextMessage>,
        model: &str,
        system_prompt: Option<&str>,
        tools: &[Value],
        tx: mpsc::Sender<ModelEvent>,
    ) -> Result<()>;
}

/// Thread (immutable history) capability.
#[async_trait]
pub trait ThreadPlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn create_thread(
        &self,
        title: &str,
        model: &str,
        system_prompt: &str,
        user: &str,
    ) -> Result<String>;
    async fn get_threads(&self, user: &str, query: Option<&str>) -> Result<Vec<ThreadSummary>>;
    async fn get_thread_messages(
        &self,
        thread_id: &str,
        user: &str,
    ) -> Result<Option<Vec<HistoryMessage>>>;
    #[allow(clippy::too_many_arguments)]
    async fn add_message(
        &self,
        thread_id: &str,
        user: &str,
        role: MessageRole,
        kind: MessageKind,
        content: &str,
        model: Option<&str>,
        aux_id: Option<&str>,
    ) -> Result<bool>;
    async fn update_thread(&self, thread_id: &str, user: &str, title: Option<&str>)
        -> Result<bool>;
    async fn archive_thread(&self, thread_id: &str, user: &str) -> Result<bool>;
    async fn search_threads(&self, query: &str, user: &str) -> Result<Vec<ThreadSearchHit>>;
}

/// Generic per-tenant typed-schema record store capability.
#[async_trait]
pub trait StorePlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()>;

    async fn create_store_if_not_exists(
        &self,
        store: &str,
        schema: &StoreSchema,
        cacheable: bool,
    ) -> Result<bool, StoreError>;
    async fn list_stores(&self) -> Result<Vec<String>, StoreError>;
    async fn find_store(&self, store: &str) -> Result<Option<StoreSchema>, StoreError>;
    async fn add(
        &self,
        user_id: &str,
        store: &str,
        data: &Record,
        record_id: Option<&str>,
    ) -> Result<String, StoreError>;
    async fn get(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        load_collections: bool,
    ) -> Result<Option<Record>, StoreError>;
    async fn find(
        &self,
        user_id: &str,
        store: &str,
        query: &FindQuery,
    ) -> Result<Vec<Record>, StoreError>;
    async fn update(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        updates: &Record,
    ) -> Result<bool, StoreError>;
    async fn delete(&self, user_id: &str, store: &str, record_id: &str)
        -> Result<bool, StoreError>;
    async fn count(&self, user_id: &str, store: &str, filters: &Filters)
        -> Result<u64, StoreError>;
    async fn collection_append(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        item: &Value,
    ) -> Result<i64, StoreError>;
    async fn collection_get(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        page: Page,
    ) -> Result<Vec<Value>, StoreError>;
    async fn full_text_search(
        &self,
        user_id: &str,
        store: &str,
        query: &str,
        page: Page,
    ) -> Result<Vec<Record>, StoreError>;
}

/// Mutable per-thread context capability, independent of history.
#[async_trait]
pub trait ContextPlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn get_context(
        &self,
        thread_id: &str,
        user_id: &str,
        strip_extra: bool,
    ) -> Result<Option<Vec<ContextMessage>>>;
    async fn add_message(
        &self,
        thread_id: &str,
        user_id: &str,
        message: ContextMessage,
        message_id: Option<&str>,
    ) -> Result<String>;
    async fn get_message(
        &self,
        thread_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ContextMessage>>;
    /// Apply `updates` to the entry with the given `_id`. A `null` value
    /// removes the key; anything else sets it. Returns whether the target
    /// existed.
    async fn update_message(
        &self,
        thread_id: &str,
        user_id: &str,
        message_id: &str,
        updates: &serde_json::Map<String, Value>,
    ) -> Result<bool>;
    async fn remove_messages(
        &self,
        thread_id: &str,
        user_id: &str,
        message_ids: &[String],
    ) -> Result<bool>;
    async fn update_context(
        &self,
        thread_id: &str,
        user_id: &str,
        context: Vec<ContextMessage>,
    ) -> Result<bool>;
    async fn regenerate_context(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Vec<ContextMessage>>;
    async fn invalidate_context(&self, thread_id: &str, user_id: &str) -> Result<bool>;
}

/// System-prompt lookup capability.
#[async_trait]
pub trait SystemPromptPlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn get_prompt(&self, key: &str) -> Option<String>;
    async fn list_prompts(&self) -> std::collections::BTreeMap<String, String>;
}

/// The turn-processing capability: drives one user submission end to end,
/// yielding the turn event stream.
#[async_trait]
pub trait MessageProcessorPlugin: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn process_message(&self, request: TurnRequest) -> Result<mpsc::Receiver<TurnEvent>>;
}

/// A role plugin instance, tagged by the capability slot it fills.
#[derive(Clone)]
pub enum RoleInstance {
    Auth(Arc<dyn AuthPlugin>),
    Model(Arc<dyn ModelPlugin>),
    Thread(Arc<dyn ThreadPlugin>),
    Store(Arc<dyn StorePlugin>),
    Context(Arc<dyn ContextPlugin>),
    SystemPrompt(Arc<dyn SystemPromptPlugin>),
    MessageProcessor(Arc<dyn MessageProcessorPlugin>),
}

impl RoleInstance {
    pub fn role(&self) -> Role {
        match self {
            RoleInstance::Auth(_) => Role::Auth,
            RoleInstance::Model(_) => Role::Model,
            RoleInstance::Thread(_) => Role::Thread,
            RoleInstance::Store(_) => Role::Store,
            RoleInstance::Context(_) => Role::Context,
            RoleInstance::SystemPrompt(_) => Role::SystemPrompt,
            RoleInstance::MessageProcessor(_) => Role::MessageProcessor,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            RoleInstance::Auth(p) => p.priority(),
            RoleInstance::Model(p) => p.priority(),
            RoleInstance::Thread(p) => p.priority(),
            RoleInstance::Store(p) => p.priority(),
            RoleInstance::Context(p) => p.priority(),
            RoleInstance::SystemPrompt(p) => p.priority(),
            RoleInstance::MessageProcessor(p) => p.priority(),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self {
            RoleInstance::Auth(p) => p.shutdown().await,
            RoleInstance::Model(p) => p.shutdown().await,
            RoleInstance::Thread(p) => p.shutdown().await,
            RoleInstance::Store(p) => p.shutdown().await,
            RoleInstance::Context(p) => p.shutdown().await,
            RoleInstance::SystemPrompt(p) => p.shutdown().await,
            RoleInstance::MessageProcessor(p) => p.shutdown().await,
        }
    }
}
