use crate::store::error::StoreError;
use crate::store::ident::{collection_table_name, fts_table_name, validate_field_name, validate_store_name};
use crate::store::query::{
    build_pagination_clause, build_where_clause, schema_with_meta, Filters, FindQuery, Page,
};
use crate::store::store::SqliteStore;
use crate::store::value::{
    bind_value, deserialize_value, serialize_value, FieldType, SqlValue, StoreSchema,
};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

pub type Record = Map<String, Value>;

/// CRUD and query surface. Every operation requires a user_id and applies it
/// in both SELECT and UPDATE/DELETE predicates; no query can return records
/// across tenants.
impl SqliteStore {
    /// Ordered column list for SELECTs: system columns wrap the schema
    /// fields so row decoding is positional and deterministic.
    pub(crate) fn record_columns(schema: &StoreSchema) -> Vec<(String, FieldType)> {
        let mut columns = vec![
            ("id".to_string(), FieldType::Str),
            ("user_id".to_string(), FieldType::Str),
        ];
        for (field, field_type) in schema {
            columns.push((field.clone(), *field_type));
        }
        columns.push(("created_at".to_string(), FieldType::Str));
        columns.push(("updated_at".to_string(), FieldType::Str));
        columns
    }

    pub(crate) fn select_list(columns: &[(String, FieldType)]) -> String {
        columns
            .iter()
            .map(|(name, _)| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn decode_row(
        row: &SqliteRow,
        columns: &[(String, FieldType)],
    ) -> Result<Record, StoreError> {
        let mut record = Record::new();
        for (i, (name, field_type)) in columns.iter().enumerate() {
            let raw = match field_type {
                FieldType::Int | FieldType::Bool => row
                    .try_get::<Option<i64>, _>(i)?
                    .map(SqlValue::Int)
                    .unwrap_or(SqlValue::Null),
                FieldType::Float => row
                    .try_get::<Option<f64>, _>(i)?
                    .map(SqlValue::Real)
                    .unwrap_or(SqlValue::Null),
                _ => row
                    .try_get::<Option<String>, _>(i)?
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
            };
            record.insert(name.clone(), deserialize_value(raw, *field_type));
        }
        Ok(record)
    }

    /// Add a new record. Fails with [`StoreError::Conflict`] if the id is
    /// already taken. json_collection columns are initialized with their
    /// metadata object; supplying a value for one is a type error.
    pub async fn add(
        &self,
        user_id: &str,
        store: &str,
        data: &Record,
        record_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let store = validate_store_name(store)?;
        let record_id = record_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!("adding record '{record_id}' to store '{store}'");

        let mut tx = self.conn.begin_write().await?;
        let result = Self::add_in(tx.conn()?, user_id, store, data, &record_id).await;
        match result {
            Ok(id) => {
                tx.commit().await?;
                Ok(id)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    pub(crate) async fn add_in(
        conn: &mut SqliteConnection,
        user_id: &str,
        store: &str,
        data: &Record,
        record_id: &str,
    ) -> Result<String, StoreError> {
        let exists = sqlx::query(&format!("SELECT 1 FROM \"{store}\" WHERE id = ?"))
            .bind(record_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!(
                "record ID '{record_id}' already exists in store '{store}'"
            )));
        }

        let schema = Self::find_store_with(conn, store)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;

        let mut fields = vec!["user_id".to_string()];
        let mut values = vec![SqlValue::Text(user_id.to_string())];
        for (field, field_type) in &schema {
            let field = validate_field_name(field)?;
            fields.push(format!("\"{field}\""));
            let value = match field_type {
                FieldType::JsonCollection => {
                    if data.get(field).map(|v| !v.is_null()).unwrap_or(false) {
                        return Err(StoreError::TypeMismatch {
                            store: store.to_string(),
                            field: field.to_string(),
                            message: "json_collection fields cannot be set directly; use collection_append"
                                .to_string(),
                        });
                    }
                    let metadata = serde_json::json!({
                        "collection_store": collection_table_name(store, field),
                        "count": 0,
                    });
                    SqlValue::Text(metadata.to_string())
                }
                _ => serialize_value(data.get(field), *field_type, field, store)?,
            };
            values.push(value);
        }

        let placeholders = vec!["?"; fields.len()].join(", ");
        let insert = format!(
            "INSERT INTO \"{store}\" (id, {}, created_at, updated_at) VALUES (?, {placeholders}, ?, ?)",
            fields.join(", ")
        );
        let now = Utc::now().to_rfc3339();
        let mut query = sqlx::query(&insert).bind(record_id);
        for value in values {
            query = bind_value(query, value);
        }
        query = query.bind(&now).bind(&now);
        query.execute(&mut *conn).await?;

        debug!("added record '{record_id}' to store '{store}' for user '{user_id}'");
        Ok(record_id.to_string())
    }

    /// Get a single record. Returns `None` on miss or cross-tenant access.
    /// With `load_collections`, every json_collection field's metadata is
    /// replaced by the full ordered item list.
    pub async fn get(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        load_collections: bool,
    ) -> Result<Option<Record>, StoreError> {
        let store = validate_store_name(store)?;

        let (schema, record) = {
            let mut read = self.conn.read().await?;
            let conn = read.conn()?;
            let Some(schema) = Self::find_store_with(conn, store).await? else {
                warn!("schema not found for store '{store}'; does the store exist?");
                return Ok(None);
            };
            let columns = Self::record_columns(&schema);
            let select = format!(
                "SELECT {} FROM \"{store}\" WHERE id = ? AND user_id = ?",
                Self::select_list(&columns)
            );
            let row = sqlx::query(&select)
                .bind(record_id)
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?;
            let Some(row) = row else {
                debug!("record '{record_id}' not found in store '{store}'");
                return Ok(None);
            };
            (schema.clone(), Self::decode_row(&row, &columns)?)
        };

        let mut record = record;
        if load_collections {
            for (field, field_type) in &schema {
                if *field_type == FieldType::JsonCollection {
                    let items = self
                        .collection_get(user_id, store, record_id, field, Page::default())
                        .await?;
                    record.insert(field.clone(), Value::Array(items));
                }
            }
        }
        Ok(Some(record))
    }

    /// Update a record. Refuses unknown fields and json_collection fields.
    /// Returns whether a row changed.
    pub async fn update(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
        updates: &Record,
    ) -> Result<bool, StoreError> {
        let store = validate_store_name(store)?;
        if updates.is_empty() {
            return Ok(true);
        }
        debug!("updating record '{record_id}' in store '{store}'");

        // Verify ownership on the read connection before taking the writer.
        {
            let mut read = self.conn.read().await?;
            let row = sqlx::query(&format!(
                "SELECT id FROM \"{store}\" WHERE id = ? AND user_id = ?"
            ))
            .bind(record_id)
            .bind(user_id)
            .fetch_optional(&mut *read.conn()?)
            .await?;
            if row.is_none() {
                return Err(StoreError::NotFound(format!(
                    "record '{record_id}' does not exist or does not belong to user '{user_id}' in store '{store}'"
                )));
            }
        }

        let mut tx = self.conn.begin_write().await?;
        let result = async {
            let conn = tx.conn()?;
            let schema = Self::find_store_with(conn, store)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;

            let invalid: Vec<&String> = updates
                .keys()
                .filter(|k| !schema.contains_key(*k))
                .collect();
            if !invalid.is_empty() {
                return Err(StoreError::Validation(format!(
                    "invalid field(s) for update in store '{store}': {invalid:?}"
                )));
            }
            let collections: Vec<&String> = updates
                .keys()
                .filter(|k| schema.get(*k) == Some(&FieldType::JsonCollection))
                .collect();
            if !collections.is_empty() {
                return Err(StoreError::Validation(format!(
                    "cannot update json_collection fields via update(): {collections:?}; use collection_append"
                )));
            }

            let mut set_clauses = Vec::new();
            let mut params = Vec::new();
            for (field, value) in updates {
                let field = validate_field_name(field)?;
                let field_type = schema[field];
                set_clauses.push(format!("\"{field}\" = ?"));
                params.push(serialize_value(Some(value), field_type, field, store)?);
            }

            let update_sql = format!(
                "UPDATE \"{store}\" SET {}, updated_at = ? WHERE id = ? AND user_id = ?",
                set_clauses.join(", ")
            );
            let mut query = sqlx::query(&update_sql);
            for value in params {
                query = bind_value(query, value);
            }
            let result = query
                .bind(Utc::now().to_rfc3339())
                .bind(record_id)
                .bind(user_id)
                .execute(&mut *conn)
                .await?;
            Ok(result.rows_affected() > 0)
        }
        .await;

        match result {
            Ok(updated) => {
                tx.commit().await?;
                debug!("update result for record '{record_id}': {updated}");
                Ok(updated)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Delete a record. Child rows go via FK cascade, FTS rows via triggers.
    pub async fn delete(
        &self,
        user_id: &str,
        store: &str,
        record_id: &str,
    ) -> Result<bool, StoreError> {
        let store = validate_store_name(store)?;
        debug!("deleting record '{record_id}' from store '{store}'");

        let mut tx = self.conn.begin_write().await?;
        let result = async {
            let conn = tx.conn()?;
            let schema = Self::find_store_with(conn, store)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;

            if schema.values().any(|t| t.is_indexable()) {
                let fts = fts_table_name(store);
                sqlx::query(&format!(
                    "DELETE FROM \"{fts}\" WHERE parent_id = ? AND user_id = ?"
                ))
                .bind(record_id)
                .bind(user_id)
                .execute(&mut *conn)
                .await?;
            }

            let result = sqlx::query(&format!(
                "DELETE FROM \"{store}\" WHERE id = ? AND user_id = ?"
            ))
            .bind(record_id)
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
            Ok(result.rows_affected() > 0)
        }
        .await;

        match result {
            Ok(deleted) => {
                tx.commit().await?;
                debug!("delete result for record '{record_id}': {deleted}");
                Ok(deleted)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Count records matching filters, always scoped to the tenant.
    pub async fn count(
        &self,
        user_id: &str,
        store: &str,
        filters: &Filters,
    ) -> Result<u64, StoreError> {
        let store = validate_store_name(store)?;
        let mut read = self.conn.read().await?;
        let conn = read.conn()?;

        let schema = Self::find_store_with(conn, store)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;
        let (where_sql, params) = build_where_clause(store, &schema, user_id, filters)?;

        let count_sql = format!("SELECT COUNT(*) AS n FROM \"{store}\" {where_sql}");
        let mut query = sqlx::query(&count_sql);
        for value in params {
            query = bind_value(query, value);
        }
        let row = query.fetch_one(&mut *conn).await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    /// Find records with filters, ordering, and pagination.
    pub async fn find(
        &self,
        user_id: &str,
        store: &str,
        query: &FindQuery,
    ) -> Result<Vec<Record>, StoreError> {
        let store = validate_store_name(store)?;
        debug!("finding records in store '{store}' (limit: {:?})", query.page.limit);
        let mut read = self.conn.read().await?;
        let conn = read.conn()?;

        let schema = Self::find_store_with(conn, store)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;
        let (where_sql, mut params) = build_where_clause(store, &schema, user_id, &query.filters)?;

        let order_sql = match &query.order_by {
            Some(order_by) => {
                let extended = schema_with_meta(&schema);
                if !extended.contains_key(order_by.as_str()) {
                    return Err(StoreError::Validation(format!(
                        "invalid order_by field '{order_by}' for store '{store}'"
                    )));
                }
                let order_by = validate_field_name(order_by)?;
                let direction = if query.order_desc { "DESC" } else { "ASC" };
                format!("ORDER BY \"{order_by}\" {direction}")
            }
            None => String::new(),
        };

        let (pagination_sql, pagination_params) = build_pagination_clause(query.page)?;
        params.extend(pagination_params);

        let columns = Self::record_columns(&schema);
        let select = format!(
            "SELECT {} FROM \"{store}\" {where_sql} {order_sql} {pagination_sql}",
            Self::select_list(&columns)
        );
        let mut q = sqlx::query(&select);
        for value in params {
            q = bind_value(q, value);
        }
        let rows = q.fetch_all(&mut *conn).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(Self::decode_row(row, &columns)?);
        }
        debug!("found {} records in store '{store}'", records.len());
        Ok(records)
    }

    /// Two-step full-text search: matching parent ids from the FTS table
    /// (tenant-filtered, rank-ordered, paginated), then the full parent rows.
    pub async fn full_text_search(
        &self,
        user_id: &str,
        store: &str,
        search: &str,
        page: Page,
    ) -> Result<Vec<Record>, StoreError> {
        let store = validate_store_name(store)?;
        debug!("full-text search in store '{store}' for '{search}'");
        let mut read = self.conn.read().await?;
        let conn = read.conn()?;

        let schema = Self::find_store_with(conn, store)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("store '{store}' does not exist")))?;
        if !schema.values().any(|t| t.is_indexable()) {
            return Err(StoreError::Validation(format!(
                "store '{store}' has no searchable fields"
            )));
        }

        // Quote the query and match as prefix.
        let match_string = format!("\"{}\"*", search.replace('"', "\"\""));
        let (pagination_sql, pagination_params) = build_pagination_clause(page)?;

        // Distinct parents ordered by their best-ranked match.
        let fts = fts_table_name(store);
        let parent_sql = format!(
            "SELECT parent_id FROM \"{fts}\"
             WHERE \"{fts}\" MATCH ? AND user_id = ?
             GROUP BY parent_id
             ORDER BY MIN(rank)
             {pagination_sql}"
        );
        let mut q = sqlx::query(&parent_sql).bind(&match_string).bind(user_id);
        for value in pagination_params {
            q = bind_value(q, value);
        }
        let parent_rows = q.fetch_all(&mut *conn).await?;
        let parent_ids: Vec<String> = parent_rows
            .iter()
            .map(|r| r.try_get::<String, _>("parent_id"))
            .collect::<Result<_, _>>()?;
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let columns = Self::record_columns(&schema);
        let placeholders = vec!["?"; parent_ids.len()].join(",");
        let main_sql = format!(
            "SELECT {} FROM \"{store}\" WHERE id IN ({placeholders}) AND user_id = ?",
            Self::select_list(&columns)
        );
        let mut q = sqlx::query(&main_sql);
        for id in &parent_ids {
            q = q.bind(id);
        }
        q = q.bind(user_id);
        let rows = q.fetch_all(&mut *conn).await?;

        // Preserve rank order from the FTS step.
        let mut by_id = std::collections::HashMap::new();
        for row in &rows {
            let record = Self::decode_row(row, &columns)?;
            if let Some(Value::String(id)) = record.get("id") {
                by_id.insert(id.clone(), record);
            }
        }
        let results: Vec<Record> = parent_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        debug!("found {} records matching '{search}' in store '{store}'", results.len());
        Ok(results)
    }
}
