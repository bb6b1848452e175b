use crate::store::crud::Record;
use crate::store::error::StoreError;
use crate::store::ident::{collection_table_name, validate_field_name, validate_store_name};
use crate::store::store::SqliteStore;
use crate::store::value::{FieldType, StoreSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A full store export: schema plus every record for every user, with
/// collection metadata replaced by the ordered item lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreExport {
    pub store: String,
    pub schema: StoreSchema,
    #[serde(default)]
    pub cacheable: bool,
    pub records: Vec<Record>,
}

/// Administrative operations: index management and bulk import/export.
/// These cross tenant boundaries on purpose and must never be reachable
/// from a non-admin surface.
impl SqliteStore {
    /// Create an index on a field. Idempotent.
    pub async fn create_index(
        &self,
        store: &str,
        field: &str,
        unique: bool,
    ) -> Result<bool, StoreError> {
        let store = validate_store_name(store)?;
        let field = validate_field_name(field)?;
        info!("creating {} index on field '{field}' in store '{store}'", if unique { "unique" } else { "default" });

        let index_name = format!("idx_{store}_{field}");
        let sql = if unique {
            format!("CREATE UNIQUE INDEX IF NOT EXISTS \"{index_name}\" ON \"{store}\"(\"{field}\")")
        } else {
            format!("CREATE INDEX IF NOT EXISTS \"{index_name}\" ON \"{store}\"(\"{field}\")")
        };

        let mut tx = self.conn.begin_write().await?;
        let result = async {
            sqlx::query(&sql).execute(&mut *tx.conn()?).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(true)
            }
            Err(e) => {
                error!("failed to create index on '{field}' in store '{store}': {e}");
                tx.rollback().await?;
                Ok(false)
            }
        }
    }

    /// Index names and their CREATE SQL, from sqlite_master.
    pub async fn get_indexes(&self, store: &str) -> Result<Vec<Value>, StoreError> {
        let store = validate_store_name(store)?;
        let mut read = self.conn.read().await?;
        let rows = sqlx::query(
            "SELECT name, sql FROM sqlite_master WHERE type='index' AND tbl_name=?",
        )
        .bind(store)
        .fetch_all(&mut *read.conn()?)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name")?;
            let sql: Option<String> = row.try_get("sql")?;
            results.push(serde_json::json!({ "name": name, "sql": sql }));
        }
        Ok(results)
    }

    /// Export all records from a store across all users. Runs outside a
    /// transaction; the result is not a strict snapshot.
    pub async fn export_store(&self, store: &str) -> Result<StoreExport, StoreError> {
        let store = validate_store_name(store)?;
        info!("exporting store '{store}'");

        let cacheable = self.is_cacheable(store).await?;
        let mut read = self.conn.read().await?;
        let conn = read.conn()?;

        let Some(schema) = Self::find_store_with(conn, store).await? else {
            warn!("store '{store}' not found for export");
            return Ok(StoreExport {
                store: store.to_string(),
                schema: StoreSchema::new(),
                cacheable: false,
                records: Vec::new(),
            });
        };

        let columns = Self::record_columns(&schema);
        let select = format!("SELECT {} FROM \"{store}\"", Self::select_list(&columns));
        let rows = sqlx::query(&select).fetch_all(&mut *conn).await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut index_by_id = std::collections::HashMap::new();
        for row in &rows {
            let record = Self::decode_row(row, &columns)?;
            if let Some(Value::String(id)) = record.get("id") {
                index_by_id.insert(id.clone(), records.len());
            }
            records.push(record);
        }

        let collection_fields: Vec<&String> = schema
            .iter()
            .filter(|(_, t)| **t == FieldType::JsonCollection)
            .map(|(n, _)| n)
            .collect();
        for field in collection_fields {
            let child = collection_table_name(store, field);
            debug!("fetching all items for '{field}' from '{child}'");
            let items_sql = format!(
                "SELECT parent_id, item_json FROM \"{child}\" ORDER BY parent_id ASC, order_index ASC"
            );
            let item_rows = sqlx::query(&items_sql).fetch_all(&mut *conn).await?;

            let mut items_by_parent: std::collections::HashMap<String, Vec<Value>> =
                std::collections::HashMap::new();
            for row in &item_rows {
                let parent_id: String = row.try_get("parent_id")?;
                if !index_by_id.contains_key(&parent_id) {
                    continue;
                }
                let item_json: String = row.try_get("item_json")?;
                match serde_json::from_str(&item_json) {
                    Ok(item) => items_by_parent.entry(parent_id).or_default().push(item),
                    Err(e) => {
                        error!("failed to deserialize item for {parent_id} in {field}: {e}")
                    }
                }
            }
            for (parent_id, idx) in &index_by_id {
                let items = items_by_parent.remove(parent_id).unwrap_or_default();
                records[*idx].insert(field.clone(), Value::Array(items));
            }
        }

        info!("exported {} records from store '{store}'", records.len());
        Ok(StoreExport {
            store: store.to_string(),
            schema,
            cacheable,
            records,
        })
    }

    /// Import records into a store. The schema is made compatible first (its
    /// own transaction); then every record goes in as one transaction so a
    /// failure leaves no partial state. Duplicate ids are skipped with a
    /// warning; any other error aborts the whole import.
    pub async fn import_store(
        &self,
        store: &str,
        data: &StoreExport,
        replace_existing: bool,
    ) -> Result<usize, StoreError> {
        let store = validate_store_name(store)?;
        if data.schema.is_empty() {
            return Err(StoreError::Validation(
                "import data must include a schema".to_string(),
            ));
        }

        info!("ensuring store '{store}' exists and schema is compatible before import");
        self.create_store_if_not_exists(store, &data.schema, data.cacheable)
            .await?;

        if data.records.is_empty() {
            info!("schema ready for '{store}', no records to import");
            return Ok(0);
        }

        info!(
            "importing {} records into store '{store}' (replace_existing={replace_existing})",
            data.records.len()
        );
        let mut imported = 0usize;
        let mut skipped = 0usize;

        let mut tx = self.conn.begin_write().await?;
        let result = async {
            let conn = tx.conn()?;
            let schema = Self::find_store_with(conn, store).await?.ok_or_else(|| {
                StoreError::NotFound(format!("store '{store}' disappeared during import setup"))
            })?;

            if replace_existing {
                info!("clearing existing data from store '{store}'");
                // Cascade handles child tables; triggers handle FTS.
                sqlx::query(&format!("DELETE FROM \"{store}\"")).execute(&mut *conn).await?;
            }

            for (idx, record) in data.records.iter().enumerate() {
                let record_id = match record.get("id") {
                    Some(Value::String(id)) if !id.is_empty() => id.clone(),
                    _ => Uuid::new_v4().to_string(),
                };
                let user_id = match record.get("user_id") {
                    Some(Value::String(u)) if !u.is_empty() => u.clone(),
                    _ => {
                        return Err(StoreError::Validation(format!(
                            "record {} missing required 'user_id' field",
                            idx + 1
                        )))
                    }
                };

                let mut parent_data = Record::new();
                let mut collection_items: Vec<(&String, &Vec<Value>)> = Vec::new();
                for (field, field_type) in &schema {
                    let Some(raw) = record.get(field) else { continue };
                    if *field_type == FieldType::JsonCollection {
                        if let Value::Array(items) = raw {
                            collection_items.push((field, items));
                        }
                        // Non-list values (metadata object, null) are ignored.
                    } else {
                        parent_data.insert(field.clone(), raw.clone());
                    }
                }

                match Self::add_in(conn, &user_id, store, &parent_data, &record_id).await {
                    Ok(_) => {}
                    Err(StoreError::Conflict(_)) => {
                        warn!(
                            "skipping record {}: ID '{record_id}' already exists in store '{store}'",
                            idx + 1
                        );
                        skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                for (field, items) in collection_items {
                    debug!(
                        "appending {} items to collection '{field}' for record '{record_id}'",
                        items.len()
                    );
                    for item in items {
                        Self::collection_append_in(conn, &user_id, store, &record_id, field, item)
                            .await?;
                    }
                }
                imported += 1;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                info!(
                    "import completed for store '{store}': imported {imported}, skipped duplicates {skipped}"
                );
                Ok(imported)
            }
            Err(e) => {
                error!("import failed for store '{store}': {e}; transaction rolled back");
                tx.rollback().await?;
                Err(e)
            }
        }
    }
}
