use crate::context::message::ContextMessage;
use crate::plugins::roles::{ContextPlugin, StorePlugin, ThreadPlugin};
use crate::store::value::{FieldType, StoreSchema};
use crate::threads::message::MessageRole;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, warn};
use uuid::Uuid;

const STORE_NAME: &str = "ThreadContext";

/// The mutable per-thread cache of messages sent to the model, backed by a
/// cacheable store record keyed by thread id. Context and history diverge
/// by design: editing a context entry never edits history, and vice versa.
/// Entries are either present or removed; no tombstones.
pub struct ContextManager {
    store: Arc<dyn StorePlugin>,
    /// Set after construction; used only by `regenerate_context`.
    threads: OnceCell<Arc<dyn ThreadPlugin>>,
}

impl ContextManager {
    pub fn new(store: Arc<dyn StorePlugin>) -> Self {
        Self {
            store,
            threads: OnceCell::new(),
        }
    }

    /// Wire the thread manager used to rebuild context from history.
    pub fn set_thread_plugin(&self, threads: Arc<dyn ThreadPlugin>) {
        let _ = self.threads.set(threads);
    }

    fn store_schema() -> StoreSchema {
        let mut schema = StoreSchema::new();
        schema.insert("context".to_string(), FieldType::Json);
        schema
    }

    async fn ensure_store(&self) -> Result<()> {
        self.store
            .create_store_if_not_exists(STORE_NAME, &Self::store_schema(), true)
            .await?;
        Ok(())
    }

    /// Load and defensively decode the stored entry list. Corrupted or
    /// mistyped payloads return `None` rather than crashing the turn.
    async fn load_entries(&self, thread_id: &str, user_id: &str) -> Result<Option<Vec<Value>>> {
        let Some(record) = self.store.get(user_id, STORE_NAME, thread_id, false).await? else {
            return Ok(None);
        };
        let Some(raw) = record.get("context") else {
            return Ok(None);
        };

        let value = match raw {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("failed to deserialize context JSON for thread {thread_id}: {e}");
                    return Ok(None);
                }
            },
            other => other.clone(),
        };

        match value {
            Value::Array(entries) => Ok(Some(entries)),
            other => {
                error!(
                    "context for thread {thread_id} is not a list: {}",
                    other.to_string().chars().take(80).collect::<String>()
                );
                Ok(None)
            }
        }
    }

    async fn save_entries(
        &self,
        thread_id: &str,
        user_id: &str,
        entries: Vec<Value>,
        create: bool,
    ) -> Result<()> {
        let mut data = Map::new();
        data.insert("context".to_string(), Value::Array(entries));
        if create {
            self.store
                .add(user_id, STORE_NAME, &data, Some(thread_id))
                .await?;
        } else {
            self.store
                .update(user_id, STORE_NAME, thread_id, &data)
                .await?;
        }
        Ok(())
    }

    fn decode(entry: &Value) -> Option<ContextMessage> {
        match serde_json::from_value(entry.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("skipping malformed context entry: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl ContextPlugin for ContextManager {
    async fn get_context(
        &self,
        thread_id: &str,
        user_id: &str,
        strip_extra: bool,
    ) -> Result<Option<Vec<ContextMessage>>> {
        self.ensure_store().await?;
        let Some(entries) = self.load_entries(thread_id, user_id).await? else {
            return Ok(None);
        };
        let messages = entries
            .iter()
            .filter_map(Self::decode)
            .map(|m| if strip_extra { m.stripped() } else { m })
            .collect();
        Ok(Some(messages))
    }

    async fn add_message(
        &self,
        thread_id: &str,
        user_id: &str,
        message: ContextMessage,
        message_id: Option<&str>,
    ) -> Result<String> {
        self.ensure_store().await?;
        let message_id = message_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut message = message;
        message.id = Some(message_id.clone());
        let entry = message.to_value();

        match self.load_entries(thread_id, user_id).await? {
            None => {
                // No context (or an unreadable one): start fresh with this
                // message. Creation only applies when the record itself is
                // absent.
                let exists = self
                    .store
                    .get(user_id, STORE_NAME, thread_id, false)
                    .await?
                    .is_some();
                self.save_entries(thread_id, user_id, vec![entry], !exists)
                    .await?;
            }
            Some(mut entries) => {
                entries.push(entry);
                self.save_entries(thread_id, user_id, entries, false).await?;
            }
        }
        Ok(message_id)
    }

    async fn get_message(
        &self,
        thread_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ContextMessage>> {
        self.ensure_store().await?;
        let Some(entries) = self.load_entries(thread_id, user_id).await? else {
            return Ok(None);
        };
        Ok(entries
            .iter()
            .find(|e| e.get("_id").and_then(Value::as_str) == Some(message_id))
            .and_then(Self::decode))
    }

    async fn update_message(
        &self,
        thread_id: &str,
        user_id: &str,
        message_id: &str,
        updates: &Map<String, Value>,
    ) -> Result<bool> {
        self.ensure_store().await?;
        let Some(mut entries) = self.load_entries(thread_id, user_id).await? else {
            return Ok(false);
        };

        let mut found = false;
        for entry in entries.iter_mut() {
            if entry.get("_id").and_then(Value::as_str) != Some(message_id) {
                continue;
            }
            if let Value::Object(fields) = entry {
                for (key, value) in updates {
                    if value.is_null() {
                        fields.remove(key);
                    } else {
                        fields.insert(key.clone(), value.clone());
                    }
                }
            }
            found = true;
            break;
        }
        if !found {
            return Ok(false);
        }

        self.save_entries(thread_id, user_id, entries, false).await?;
        Ok(true)
    }

    async fn remove_messages(
        &self,
        thread_id: &str,
        user_id: &str,
        message_ids: &[String],
    ) -> Result<bool> {
        self.ensure_store().await?;
        let Some(entries) = self.load_entries(thread_id, user_id).await? else {
            return Ok(false);
        };

        let before = entries.len();
        let kept: Vec<Value> = entries
            .into_iter()
            .filter(|e| {
                e.get("_id")
                    .and_then(Value::as_str)
                    .map(|id| !message_ids.iter().any(|m| m == id))
                    .unwrap_or(true)
            })
            .collect();
        if kept.len() == before {
            return Ok(false);
        }

        self.save_entries(thread_id, user_id, kept, false).await?;
        Ok(true)
    }

    async fn update_context(
        &self,
        thread_id: &str,
        user_id: &str,
        context: Vec<ContextMessage>,
    ) -> Result<bool> {
        self.ensure_store().await?;
        let entries: Vec<Value> = context
            .into_iter()
            .map(|mut m| {
                if m.id.is_none() {
                    m.id = Some(Uuid::new_v4().to_string());
                }
                m.to_value()
            })
            .collect();

        let exists = self
            .store
            .get(user_id, STORE_NAME, thread_id, false)
            .await?
            .is_some();
        self.save_entries(thread_id, user_id, entries, !exists).await?;
        Ok(true)
    }

    async fn regenerate_context(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Vec<ContextMessage>> {
        self.invalidate_context(thread_id, user_id).await?;

        let Some(threads) = self.threads.get() else {
            warn!("regenerate_context called before thread plugin was wired");
            return Ok(Vec::new());
        };
        let Some(history) = threads.get_thread_messages(thread_id, user_id).await? else {
            return Ok(Vec::new());
        };

        // Rebuild from user and assistant messages only, fresh ids, no
        // extra fields.
        let mut rebuilt = Vec::new();
        for msg in history {
            let role = match msg.role {
                MessageRole::User => crate::context::message::ContextRole::User,
                MessageRole::Assistant => crate::context::message::ContextRole::Assistant,
                _ => continue,
            };
            let mut entry = ContextMessage::new(role, msg.content);
            entry.id = Some(Uuid::new_v4().to_string());
            rebuilt.push(entry);
        }

        self.update_context(thread_id, user_id, rebuilt.clone()).await?;
        Ok(rebuilt)
    }

    async fn invalidate_context(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        self.ensure_store().await?;
        Ok(self.store.delete(user_id, STORE_NAME, thread_id).await?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::store::SqliteStore;
    use serde_json::json;

    fn manager() -> (tempfile::TempDir, ContextManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path().join("ctx.db")));
        (dir, ContextManager::new(store))
    }

    #[tokio::test]
    async fn add_then_get_roundtrips_stripped_form() {
        let (_dir, mgr) = manager();
        let id = mgr
            .add_message("t1", "u1", ContextMessage::user("Hello"), None)
            .await
            .unwrap();
        assert!(!id.is_empty());

        let context = mgr.get_context("t1", "u1", true).await.unwrap().unwrap();
        assert_eq!(context.len(), 1);
        assert!(context[0].id.is_none());
        assert_eq!(context[0].content, "Hello");

        let raw = mgr.get_context("t1", "u1", false).await.unwrap().unwrap();
        assert_eq!(raw[0].id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn missing_context_returns_none() {
        let (_dir, mgr) = manager();
        assert!(mgr.get_context("absent", "u1", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn contexts_are_tenant_scoped() {
        let (_dir, mgr) = manager();
        mgr.add_message("t1", "u1", ContextMessage::user("mine"), None)
            .await
            .unwrap();
        assert!(mgr.get_context("t1", "u2", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_message_sets_and_removes_keys() {
        let (_dir, mgr) = manager();
        let mut message = ContextMessage::assistant("answer");
        message.reasoning_content = Some("thinking…".to_string());
        let id = mgr.add_message("t1", "u1", message, Some("m1")).await.unwrap();
        assert_eq!(id, "m1");

        // Null removes; non-null sets.
        let mut updates = Map::new();
        updates.insert("reasoning_content".to_string(), Value::Null);
        updates.insert("content".to_string(), json!("edited"));
        assert!(mgr.update_message("t1", "u1", "m1", &updates).await.unwrap());

        let msg = mgr.get_message("t1", "u1", "m1").await.unwrap().unwrap();
        assert!(msg.reasoning_content.is_none());
        assert_eq!(msg.content, "edited");

        assert!(!mgr.update_message("t1", "u1", "missing", &updates).await.unwrap());
    }

    #[tokio::test]
    async fn remove_messages_filters_by_id() {
        let (_dir, mgr) = manager();
        mgr.add_message("t1", "u1", ContextMessage::user("a"), Some("m1"))
            .await
            .unwrap();
        mgr.add_message("t1", "u1", ContextMessage::user("b"), Some("m2"))
            .await
            .unwrap();

        assert!(mgr
            .remove_messages("t1", "u1", &["m1".to_string()])
            .await
            .unwrap());
        let context = mgr.get_context("t1", "u1", false).await.unwrap().unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].id.as_deref(), Some("m2"));

        assert!(!mgr
            .remove_messages("t1", "u1", &["m1".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn update_context_overwrites_and_assigns_ids() {
        let (_dir, mgr) = manager();
        mgr.add_message("t1", "u1", ContextMessage::user("old"), None)
            .await
            .unwrap();

        let replacement = vec![
            ContextMessage::user("compressed summary"),
            ContextMessage::assistant("ack"),
        ];
        assert!(mgr.update_context("t1", "u1", replacement).await.unwrap());

        let context = mgr.get_context("t1", "u1", false).await.unwrap().unwrap();
        assert_eq!(context.len(), 2);
        assert!(context.iter().all(|m| m.id.is_some()));
        assert_eq!(context[0].content, "compressed summary");
    }

    #[tokio::test]
    async fn invalidate_deletes_the_record() {
        let (_dir, mgr) = manager();
        mgr.add_message("t1", "u1", ContextMessage::user("x"), None)
            .await
            .unwrap();
        assert!(mgr.invalidate_context("t1", "u1").await.unwrap());
        assert!(mgr.get_context("t1", "u1", true).await.unwrap().is_none());
    }
}
