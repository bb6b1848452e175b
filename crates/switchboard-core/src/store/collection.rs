use crate::store::error::StoreError;
use crate::store::ident::{collection_table_name, validate_field_name, validate_store_name};
use crate::store::query::{build_pagination_clause, Page};
use crate::store::store::SqliteStore;
use crate::store::value::{bind_value, FieldType};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Append-only collection operations over json_collection child tables.
/// Items keep insertion order through a contiguous 0-based order_index;
/// the parent's metadata column tracks the count in the same transaction.
impl SqliteStore {
    /// Append an item to a collection. Returns the assigned order_index.
    pub async fn collection_append(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        item: &Value,
    ) -> Result<i64, StoreError> {
        let store = validate_store_name(store)?;
        let field = validate_field_name(field)?;
        debug!("appending item to collection '{field}' in record '{record_id}' of store '{store}'");

        let mut tx = self.conn.begin_write().await?;
        let result =
            Self::collection_append_in(tx.conn()?, user_id, store, record_id, field, item).await;
        match result {
            Ok(index) => {
                tx.commit().await?;
                Ok(index)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    pub(crate) async fn collection_append_in(
        conn: &mut SqliteConnection,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        item: &Value,
    ) -> Result<i64, StoreError> {
        if !matches!(item, Value::Object(_) | Value::Array(_)) {
            return Err(StoreError::TypeMismatch {
                store: store.to_string(),
                field: field.to_string(),
                message: "collection item must be an object or array".to_string(),
            });
        }
        let schema = Self::find_store_with(conn, store)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;
        match schema.get(field) {
            None => {
                return Err(StoreError::NotFound(format!(
                    "field '{field}' does not exist in store '{store}'"
                )))
            }
            Some(FieldType::JsonCollection) => {}
            Some(other) => {
                return Err(StoreError::TypeMismatch {
                    store: store.to_string(),
                    field: field.to_string(),
                    message: format!(
                        "field is type {other:?}, not json_collection; use update() instead"
                    ),
                })
            }
        }

        let owner = sqlx::query(&format!(
            "SELECT id FROM \"{store}\" WHERE id = ? AND user_id = ?"
        ))
        .bind(record_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
        if owner.is_none() {
            return Err(StoreError::NotFound(format!(
                "record '{record_id}' does not exist in store '{store}'"
            )));
        }

        let child = collection_table_name(store, field);
        let count_row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM \"{child}\" WHERE parent_id = ?"
        ))
        .bind(record_id)
        .fetch_one(&mut *conn)
        .await?;
        let order_index: i64 = count_row.try_get("n")?;

        let item_json = item.to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(&format!(
            "INSERT INTO \"{child}\" (id, parent_id, order_index, item_json, created_at)
             VALUES (?, ?, ?, ?, ?)"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(record_id)
        .bind(order_index)
        .bind(&item_json)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        // Ownership was verified above; the metadata update rides the same
        // transaction as the insert.
        let metadata = serde_json::json!({
            "collection_store": child,
            "count": order_index + 1,
        });
        sqlx::query(&format!(
            "UPDATE \"{store}\" SET \"{field}\" = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(metadata.to_string())
        .bind(&now)
        .bind(record_id)
        .execute(&mut *conn)
        .await?;

        info!(
            "appended item to '{field}' in record '{record_id}' at index {order_index} (new count: {})",
            order_index + 1
        );
        Ok(order_index)
    }

    /// Get collection items in insertion order with pagination. Malformed
    /// stored items are skipped with a log entry.
    pub async fn collection_get(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        field: &str,
        page: Page,
    ) -> Result<Vec<Value>, StoreError> {
        let store = validate_store_name(store)?;
        let field = validate_field_name(field)?;
        debug!(
            "getting items from collection '{field}' in record '{record_id}' of store '{store}' (limit={:?}, offset={})",
            page.limit, page.offset
        );

        let mut read = self.conn.read().await?;
        let conn = read.conn()?;

        let owner = sqlx::query(&format!(
            "SELECT id FROM \"{store}\" WHERE id = ? AND user_id = ?"
        ))
        .bind(record_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
        if owner.is_none() {
            return Err(StoreError::NotFound(format!(
                "record '{record_id}' does not exist or does not belong to user '{user_id}' in store '{store}'"
            )));
        }

        let child = collection_table_name(store, field);
        let (pagination_sql, pagination_params) = build_pagination_clause(page)?;
        let select = format!(
            "SELECT item_json FROM \"{child}\"
             WHERE parent_id = ?
             ORDER BY order_index ASC
             {pagination_sql}"
        );
        let mut query = sqlx::query(&select).bind(record_id);
        for value in pagination_params {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&mut *conn).await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let item_json: String = row.try_get("item_json")?;
            match serde_json::from_str(&item_json) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!("skipping malformed collection item in '{child}': {e}");
                }
            }
        }
        debug!("retrieved {} items from collection '{field}' in record '{record_id}'", items.len());
        Ok(items)
    }
}
