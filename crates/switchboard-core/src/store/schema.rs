use crate::store::error::StoreError;
use crate::store::ident::{
    collection_table_name, fts_table_name, validate_field_name, validate_store_name,
};
use crate::store::store::SqliteStore;
use crate::store::value::{FieldType, StoreSchema};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, info, warn};

/// Schema lifecycle: store creation, schema diffing, child tables for
/// collections, and the FTS tables plus the triggers that keep them in sync.
/// The FTS index is maintained purely by triggers, never by application code.
impl SqliteStore {
    /// Create a store if absent. If it already exists, diff the schemas:
    /// missing fields are added with `ALTER TABLE` (plus child tables and
    /// triggers where needed), extra fields in storage are ignored, and the
    /// stored schema JSON is updated in the same transaction.
    ///
    /// Returns true when the store was newly created. Calling twice with the
    /// same arguments is a no-op the second time.
    pub async fn create_store_if_not_exists(
        &self,
        store: &str,
        schema: &StoreSchema,
        cacheable: bool,
    ) -> Result<bool, StoreError> {
        let store = validate_store_name(store)?;
        let schema = Self::effective_schema(schema, cacheable);
        info!("ensuring store '{store}' with {} fields (cacheable={cacheable})", schema.len());

        let mut tx = self.conn.begin_write().await?;
        let result = Self::create_store_in(tx.conn()?, store, &schema, cacheable).await;
        match result {
            Ok(created) => {
                tx.commit().await?;
                Ok(created)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Cacheable stores carry the `_version` auto-field.
    pub(crate) fn effective_schema(schema: &StoreSchema, cacheable: bool) -> StoreSchema {
        let mut schema = schema.clone();
        if cacheable {
            schema
                .entry("_version".to_string())
                .or_insert(FieldType::Str);
        }
        schema
    }

    pub(crate) async fn create_store_in(
        conn: &mut SqliteConnection,
        store: &str,
        schema: &StoreSchema,
        cacheable: bool,
    ) -> Result<bool, StoreError> {
        let existing = sqlx::query("SELECT schema_json FROM _stores WHERE name = ?")
            .bind(store)
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(row) = existing {
            let schema_json: String = row.try_get("schema_json")?;
            let mut existing_schema: StoreSchema = serde_json::from_str(&schema_json)
                .map_err(|e| StoreError::Corruption(format!("schema for '{store}': {e}")))?;

            let missing: Vec<_> = schema
                .iter()
                .filter(|(name, _)| !existing_schema.contains_key(*name))
                .collect();
            let extra: Vec<_> = existing_schema
                .keys()
                .filter(|name| !schema.contains_key(*name))
                .cloned()
                .collect();
            if !extra.is_empty() {
                info!("store '{store}': ignoring extra stored fields {extra:?}");
            }

            if !missing.is_empty() {
                info!(
                    "store '{store}': adding missing fields {:?}",
                    missing.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
                );
                for (field, field_type) in &missing {
                    let field = validate_field_name(field)?;
                    let alter = format!(
                        "ALTER TABLE \"{store}\" ADD COLUMN \"{field}\" {}",
                        field_type.sql_type()
                    );
                    info!("adding column '{field}' to store '{store}'");
                    sqlx::query(&alter).execute(&mut *conn).await?;
                    if **field_type == FieldType::JsonCollection {
                        Self::create_collection_child_table(conn, store, field).await?;
                    }
                }
                for (field, field_type) in missing {
                    existing_schema.insert(field.clone(), *field_type);
                }
                let updated =
                    serde_json::to_string(&existing_schema).map_err(|e| {
                        StoreError::Corruption(format!("schema for '{store}': {e}"))
                    })?;
                sqlx::query("UPDATE _stores SET schema_json = ? WHERE name = ?")
                    .bind(updated)
                    .bind(store)
                    .execute(&mut *conn)
                    .await?;
            }
            debug!("store '{store}' already exists");
            return Ok(false);
        }

        info!("store '{store}' does not exist, creating");

        let mut columns = vec!["user_id TEXT NOT NULL".to_string()];
        let mut collection_fields = Vec::new();
        for (field, field_type) in schema {
            let field = validate_field_name(field)?;
            columns.push(format!("\"{field}\" {}", field_type.sql_type()));
            if *field_type == FieldType::JsonCollection {
                collection_fields.push(field);
            }
        }

        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{store}\" (
                id TEXT PRIMARY KEY,
                {},
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            columns.join(",\n                ")
        );
        sqlx::query(&create).execute(&mut *conn).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{store}_user_id\" ON \"{store}\" (user_id)"
        );
        sqlx::query(&index).execute(&mut *conn).await?;

        for field in &collection_fields {
            Self::create_collection_child_table(conn, store, field).await?;
        }

        let indexable: Vec<&str> = schema
            .iter()
            .filter(|(_, t)| t.is_indexable())
            .map(|(n, _)| n.as_str())
            .collect();
        if !indexable.is_empty() {
            let fts = fts_table_name(store);
            let fts_columns = indexable
                .iter()
                .map(|f| format!("\"{f}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let create_fts = format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS \"{fts}\" USING fts5(
                    user_id UNINDEXED,
                    parent_id UNINDEXED,
                    child_id UNINDEXED,
                    {fts_columns},
                    tokenize='porter'
                )"
            );
            sqlx::query(&create_fts).execute(&mut *conn).await?;
            info!("created FTS table '{fts}' over {indexable:?}");
            Self::create_fts_triggers(conn, store, &indexable).await?;
        }

        let schema_json = serde_json::to_string(schema)
            .map_err(|e| StoreError::Corruption(format!("schema for '{store}': {e}")))?;
        sqlx::query(
            "INSERT INTO _stores (name, schema_json, cacheable, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(store)
        .bind(schema_json)
        .bind(i64::from(cacheable))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;

        info!(
            "created store '{store}' with {} collection field(s)",
            collection_fields.len()
        );
        Ok(true)
    }

    async fn create_collection_child_table(
        conn: &mut SqliteConnection,
        store: &str,
        field: &str,
    ) -> Result<(), StoreError> {
        let child = collection_table_name(store, field);
        info!("creating child table '{child}' for collection field '{field}'");

        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{child}\" (
                id TEXT PRIMARY KEY,
                parent_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                item_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (parent_id) REFERENCES \"{store}\"(id) ON DELETE CASCADE,
                UNIQUE(parent_id, order_index)
            )"
        );
        sqlx::query(&create).execute(&mut *conn).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{child}_parent\" ON \"{child}\"(parent_id, order_index)"
        );
        sqlx::query(&index).execute(&mut *conn).await?;

        // Child tables are themselves registered as stores.
        let child_schema = serde_json::json!({
            "parent_id": "str",
            "order_index": "int",
            "item_json": "json",
        });
        sqlx::query(
            "INSERT OR IGNORE INTO _stores (name, schema_json, cacheable, created_at) VALUES (?, ?, 0, ?)",
        )
        .bind(&child)
        .bind(child_schema.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;

        Self::create_collection_fts_triggers(conn, store, field, &child).await?;
        Ok(())
    }

    async fn create_collection_fts_triggers(
        conn: &mut SqliteConnection,
        store: &str,
        field: &str,
        child: &str,
    ) -> Result<(), StoreError> {
        let fts = fts_table_name(store);

        let insert_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS \"fts_{child}_insert\"
             AFTER INSERT ON \"{child}\"
             BEGIN
                 INSERT INTO \"{fts}\" (user_id, parent_id, child_id, \"{field}\")
                 SELECT parent.user_id, NEW.parent_id, '{field}_' || NEW.id, NEW.item_json
                 FROM \"{store}\" parent WHERE parent.id = NEW.parent_id;
             END"
        );
        sqlx::query(&insert_trigger).execute(&mut *conn).await?;

        let delete_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS \"fts_{child}_delete\"
             AFTER DELETE ON \"{child}\"
             BEGIN
                 DELETE FROM \"{fts}\" WHERE child_id = '{field}_' || OLD.id;
             END"
        );
        sqlx::query(&delete_trigger).execute(&mut *conn).await?;
        info!("created FTS triggers for collection table '{child}'");
        Ok(())
    }

    async fn create_fts_triggers(
        conn: &mut SqliteConnection,
        store: &str,
        indexable: &[&str],
    ) -> Result<(), StoreError> {
        let fts = fts_table_name(store);
        let fts_columns = indexable
            .iter()
            .map(|f| format!("\"{f}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let new_values = indexable
            .iter()
            .map(|f| format!("NEW.\"{f}\""))
            .collect::<Vec<_>>()
            .join(", ");

        let insert_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS \"fts_{store}_insert\"
             AFTER INSERT ON \"{store}\"
             BEGIN
                 INSERT INTO \"{fts}\" (user_id, parent_id, child_id, {fts_columns})
                 VALUES (NEW.user_id, NEW.id, '', {new_values});
             END"
        );
        sqlx::query(&insert_trigger).execute(&mut *conn).await?;

        let update_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS \"fts_{store}_update\"
             AFTER UPDATE ON \"{store}\"
             BEGIN
                 DELETE FROM \"{fts}\" WHERE parent_id = OLD.id AND user_id = OLD.user_id AND child_id = '';
                 INSERT INTO \"{fts}\" (user_id, parent_id, child_id, {fts_columns})
                 VALUES (NEW.user_id, NEW.id, '', {new_values});
             END"
        );
        sqlx::query(&update_trigger).execute(&mut *conn).await?;

        let delete_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS \"fts_{store}_delete\"
             AFTER DELETE ON \"{store}\"
             BEGIN
                 DELETE FROM \"{fts}\" WHERE parent_id = OLD.id AND user_id = OLD.user_id;
             END"
        );
        sqlx::query(&delete_trigger).execute(&mut *conn).await?;
        info!("created FTS triggers for store '{store}'");
        Ok(())
    }

    // ── Metadata queries ──────────────────────────────────────────────────────

    pub async fn list_stores(&self) -> Result<Vec<String>, StoreError> {
        let mut read = self.conn.read().await?;
        let rows = sqlx::query("SELECT name FROM _stores ORDER BY name")
            .fetch_all(&mut *read.conn()?)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    pub async fn find_store(&self, store: &str) -> Result<Option<StoreSchema>, StoreError> {
        let store = validate_store_name(store)?;
        let mut read = self.conn.read().await?;
        Self::find_store_with(read.conn()?, store).await
    }

    pub(crate) async fn find_store_with(
        conn: &mut SqliteConnection,
        store: &str,
    ) -> Result<Option<StoreSchema>, StoreError> {
        let row = sqlx::query("SELECT schema_json FROM _stores WHERE name = ?")
            .bind(store)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => {
                let schema_json: String = row.try_get("schema_json")?;
                let schema = serde_json::from_str(&schema_json)
                    .map_err(|e| StoreError::Corruption(format!("schema for '{store}': {e}")))?;
                Ok(Some(schema))
            }
            None => {
                debug!("store '{store}' not found");
                Ok(None)
            }
        }
    }

    pub async fn is_cacheable(&self, store: &str) -> Result<bool, StoreError> {
        let store = validate_store_name(store)?;
        let mut read = self.conn.read().await?;
        let row = sqlx::query("SELECT cacheable FROM _stores WHERE name = ?")
            .bind(store)
            .fetch_optional(&mut *read.conn()?)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("cacheable")? != 0),
            None => {
                warn!("store '{store}' not found when checking cacheable status");
                Ok(false)
            }
        }
    }

    /// Record count and age range for a store.
    pub async fn get_store_stats(&self, store: &str) -> Result<Value, StoreError> {
        let store = validate_store_name(store)?;
        let mut read = self.conn.read().await?;
        let conn = read.conn()?;

        let count_row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM \"{store}\""))
            .fetch_one(&mut *conn)
            .await?;
        let count: i64 = count_row.try_get("n")?;

        let range_row = sqlx::query(&format!(
            "SELECT MIN(created_at) AS oldest, MAX(created_at) AS newest FROM \"{store}\""
        ))
        .fetch_one(&mut *conn)
        .await?;
        let oldest: Option<String> = range_row.try_get("oldest")?;
        let newest: Option<String> = range_row.try_get("newest")?;

        Ok(serde_json::json!({
            "store": store,
            "record_count": count,
            "oldest_record": oldest,
            "newest_record": newest,
        }))
    }
}
