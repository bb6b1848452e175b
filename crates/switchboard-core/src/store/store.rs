use crate::plugins::roles::StorePlugin;
use crate::store::connection::ConnectionManager;
use crate::store::crud::Record;
use crate::store::error::StoreError;
use crate::store::query::{Filters, FindQuery, Page};
use crate::store::value::StoreSchema;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// SQLite/FTS5 facade over the connection, schema, CRUD, collection, and
/// admin operation sets. The single durable-state component of the system.
pub struct SqliteStore {
    pub(crate) conn: Arc<ConnectionManager>,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            conn: Arc::new(ConnectionManager::new(db_path)),
        }
    }

    /// Refuse new work, flush the WAL, close both connections.
    pub async fn shutdown(&self) {
        self.conn.shutdown().await;
    }
}

#[async_trait]
impl StorePlugin for SqliteStore {
    async fn shutdown(&self) -> Result<()> {
        SqliteStore::shutdown(self).await;
        Ok(())
    }

    async fn create_store_if_not_exists(
        &self,
        store: &str,
        schema: &StoreSchema,
        cacheable: bool,
    ) -> Result<bool, StoreError> {
        SqliteStore::create_store_if_not_exists(self, store, schema, cacheable).await
    }

    async fn list_stores(&self) -> Result<Vec<String>, StoreError> {
        SqliteStore::list_stores(self).await
    }

    async fn find_store(&self, store: &str) -> Result<Option<StoreSchema>, StoreError> {
        SqliteStore::find_store(self, store).await
    }

    async fn add(
        &self,
        user_id: &str,
        store: &str,
        data: &Record,
        record_id: Option<&str>,
    ) -> Result<String, StoreError> {
        SqliteStore::add(self, user_id, store, data, record_id).await
    }

    async fn get(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        load_collections: bool,
    ) -> Result<Option<Record>, StoreError> {
        SqliteStore::get(self, user_id, store, record_id, load_collections).await
    }

    async fn find(
        &self,
        user_id: &str,
        store: &str,
        query: &FindQuery,
    ) -> Result<Vec<Record>, StoreError> {
        SqliteStore::find(self, user_id, store, query).await
    }

    async fn update(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        updates: &Record,
    ) -> Result<bool, StoreError> {
        SqliteStore::update(self, user_id, store, record_id, updates).await
    }

    async fn delete(&self, user_id: &str, store: &str, record_id: &str) -> Result<bool, StoreError> {
        SqliteStore::delete(self, user_id, store, record_id).await
    }

    async fn count(&self, user_id: &str, store: &str, filters: &Filters) -> Result<u64, StoreError> {
        SqliteStore::count(self, user_id, store, filters).await
    }

    async fn collection_append(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        item: &Value,
    ) -> Result<i64, StoreError> {
        SqliteStore::collection_append(self, user_id, store, record_id, field, item).await
    }

    async fn collection_get(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        page: Page,
    ) -> Result<Vec<Value>, StoreError> {
        SqliteStore::collection_get(self, user_id, store, record_id, field, page).await
    }

    async fn full_text_search(
        &self,
        user_id: &str,
        store: &str,
        query: &str,
        page: Page,
    ) -> Result<Vec<Record>, StoreError> {
        SqliteStore::full_text_search(self, user_id, store, query, page).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
