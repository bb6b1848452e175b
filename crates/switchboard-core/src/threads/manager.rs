use crate::plugins::roles::{StorePlugin, ThreadPlugin};
use crate::store::query::{FilterCondition, Filters, FindQuery, Page};
use crate::store::value::{FieldType, StoreSchema};
use crate::threads::message::{HistoryMessage, MessageKind, MessageRole};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

const STORE_NAME: &str = "ChatHistoryThreads";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: String,
    pub title: String,
    pub created: String,
    pub model: String,
    pub system_prompt: String,
}

/// A search result: thread id, title, and a snippet when the match was
/// found in a message rather than the title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSearchHit {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Thin wrapper over the store that materializes the Thread entity: a
/// record per thread, with history as an append-only messages collection.
/// Archive is a boolean flag and a query concern, never deletion.
pub struct ThreadManager {
    store: Arc<dyn StorePlugin>,
}

impl ThreadManager {
    pub fn new(store: Arc<dyn StorePlugin>) -> Self {
        Self { store }
    }

    fn store_schema() -> StoreSchema {
        let mut schema = StoreSchema::new();
        schema.insert("title".to_string(), FieldType::Str);
        schema.insert("model".to_string(), FieldType::Str);
        schema.insert("system_prompt".to_string(), FieldType::Str);
        schema.insert("user".to_string(), FieldType::Str);
        schema.insert("is_archived".to_string(), FieldType::Bool);
        schema.insert("messages".to_string(), FieldType::JsonCollection);
        schema
    }

    async fn ensure_store(&self) -> Result<()> {
        self.store
            .create_store_if_not_exists(STORE_NAME, &Self::store_schema(), false)
            .await?;
        Ok(())
    }

    fn summary_from(record: &Map<String, Value>) -> ThreadSummary {
        let text = |key: &str| {
            record
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        ThreadSummary {
            id: text("id"),
            title: text("title"),
            created: text("created_at"),
            model: text("model"),
            system_prompt: text("system_prompt"),
        }
    }

    /// ±50 chars of context around the first match, with ellipses on cut
    /// edges.
    fn build_snippet(content: &str, query: &str) -> Option<String> {
        let haystack = content.to_lowercase();
        let needle = query.to_lowercase();
        let hit = haystack.find(&needle)?;

        let chars: Vec<char> = content.chars().collect();
        // Byte offset in the lowercased text → char offset; clamp in case
        // lowercasing shifted lengths.
        let char_hit = std::cmp::min(haystack[..hit].chars().count(), chars.len());
        let start = char_hit.saturating_sub(50);
        let end = std::cmp::min(chars.len(), char_hit + needle.chars().count() + 50);

        let mut snippet: String = chars[start..end].iter().collect();
        if start > 0 {
            snippet = format!("...{snippet}");
        }
        if end < chars.len() {
            snippet = format!("{snippet}...");
        }
        Some(snippet)
    }
}

#[async_trait]
impl ThreadPlugin for ThreadManager {
    async fn create_thread(
        &self,
        title: &str,
        model: &str,
        system_prompt: &str,
        user: &str,
    ) -> Result<String> {
        self.ensure_store().await?;
        let mut data = Map::new();
        data.insert("title".to_string(), json!(title));
        data.insert("model".to_string(), json!(model));
        data.insert("system_prompt".to_string(), json!(system_prompt));
        data.insert("user".to_string(), json!(user));
        data.insert("is_archived".to_string(), json!(false));
        let thread_id = self.store.add(user, STORE_NAME, &data, None).await?;
        Ok(thread_id)
    }

    async fn get_threads(&self, user: &str, query: Option<&str>) -> Result<Vec<ThreadSummary>> {
        self.ensure_store().await?;
        let mut filters = Filters::new();
        filters.insert(
            "is_archived".to_string(),
            FilterCondition::Equals(json!(false)),
        );
        let records = self
            .store
            .find(
                user,
                STORE_NAME,
                &FindQuery {
                    filters,
                    page: Page::default(),
                    order_by: Some("created_at".to_string()),
                    order_desc: true,
                },
            )
            .await?;

        let needle = query.map(str::to_lowercase);
        Ok(records
            .iter()
            .map(Self::summary_from)
            .filter(|t| match &needle {
                Some(q) => t.title.to_lowercase().contains(q),
                None => true,
            })
            .collect())
    }

    async fn get_thread_messages(
        &self,
        thread_id: &str,
        user: &str,
    ) -> Result<Option<Vec<HistoryMessage>>> {
        self.ensure_store().await?;
        if self
            .store
            .get(user, STORE_NAME, thread_id, false)
            .await?
            .is_none()
        {
            return Ok(None);
        }

        let items = self
            .store
            .collection_get(user, STORE_NAME, thread_id, "messages", Page::default())
            .await?;
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<HistoryMessage>(item) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("skipping malformed history message in thread {thread_id}: {e}"),
            }
        }
        Ok(Some(messages))
    }

    async fn add_message(
        &self,
        thread_id: &str,
        user: &str,
        role: MessageRole,
        kind: MessageKind,
        content: &str,
        model: Option<&str>,
        aux_id: Option<&str>,
    ) -> Result<bool> {
        self.ensure_store().await?;
        if self
            .store
            .get(user, STORE_NAME, thread_id, false)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        let message = HistoryMessage {
            role,
            kind,
            content: content.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            model: model.map(str::to_string),
            aux_id: aux_id.map(str::to_string),
        };
        self.store
            .collection_append(
                user,
                STORE_NAME,
                thread_id,
                "messages",
                &serde_json::to_value(&message)?,
            )
            .await?;
        Ok(true)
    }

    async fn update_thread(
        &self,
        thread_id: &str,
        user: &str,
        title: Option<&str>,
    ) -> Result<bool> {
        self.ensure_store().await?;
        let Some(title) = title else {
            return Ok(true);
        };
        let mut updates = Map::new();
        updates.insert("title".to_string(), json!(title));
        match self.store.update(user, STORE_NAME, thread_id, &updates).await {
            Ok(updated) => Ok(updated),
            Err(crate::store::error::StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn archive_thread(&self, thread_id: &str, user: &str) -> Result<bool> {
        self.ensure_store().await?;
        let mut updates = Map::new();
        updates.insert("is_archived".to_string(), json!(true));
        match self.store.update(user, STORE_NAME, thread_id, &updates).await {
            Ok(updated) => Ok(updated),
            Err(crate::store::error::StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn search_threads(&self, query: &str, user: &str) -> Result<Vec<ThreadSearchHit>> {
        self.ensure_store().await?;
        let hits = self
            .store
            .full_text_search(user, STORE_NAME, query, Page::default())
            .await?;

        let mut results = Vec::new();
        for record in &hits {
            if record
                .get("is_archived")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }
            let summary = Self::summary_from(record);

            if summary.title.to_lowercase().contains(&query.to_lowercase()) {
                results.push(ThreadSearchHit {
                    id: summary.id,
                    title: summary.title,
                    snippet: None,
                });
                continue;
            }

            // Title did not match: the hit came from a message; find the
            // first one and cut a snippet around it.
            let items = self
                .store
                .collection_get(user, STORE_NAME, &summary.id, "messages", Page::default())
                .await?;
            let snippet = items.iter().find_map(|item| {
                item.get("content")
                    .and_then(Value::as_str)
                    .and_then(|content| Self::build_snippet(content, query))
            });
            results.push(ThreadSearchHit {
                id: summary.id,
                title: summary.title,
                snippet,
            });
        }
        Ok(results)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
