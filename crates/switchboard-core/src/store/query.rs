use crate::store::error::StoreError;
use crate::store::ident::validate_field_name;
use crate::store::value::{serialize_value, FieldType, SqlValue, StoreSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Comparison operators accepted in find filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "$like")]
    Like,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$gte")]
    Gte,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$lte")]
    Lte,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            FilterOp::Like => "LIKE",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        }
    }
}

/// A single filter condition: exact match, or a set of operator comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterCondition {
    Ops(BTreeMap<FilterOp, Value>),
    Equals(Value),
}

/// Filters keyed by field name.
pub type Filters = BTreeMap<String, FilterCondition>;

/// Pagination window. Both bounds are validated as non-negative.
#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: i64,
}

impl Page {
    pub fn limit(limit: i64) -> Self {
        Self {
            limit: Some(limit),
            offset: 0,
        }
    }
}

/// Full query surface of `find`.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filters: Filters,
    pub page: Page,
    pub order_by: Option<String>,
    pub order_desc: bool,
}

/// Build a `LIMIT ? OFFSET ?` fragment with validation. Zero offset and
/// absent limit produce an empty fragment.
pub fn build_pagination_clause(page: Page) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut parts = Vec::new();
    let mut params = Vec::new();

    if let Some(limit) = page.limit {
        if limit < 0 {
            return Err(StoreError::Validation(
                "limit must be a non-negative integer".to_string(),
            ));
        }
        parts.push("LIMIT ?");
        params.push(SqlValue::Int(limit));
    }
    if page.offset != 0 {
        if page.offset < 0 {
            return Err(StoreError::Validation(
                "offset must be a non-negative integer".to_string(),
            ));
        }
        parts.push("OFFSET ?");
        params.push(SqlValue::Int(page.offset));
    }

    Ok((parts.join(" "), params))
}

/// Schema extended with the system columns, used to validate filter and
/// order_by fields. ISO8601 timestamps compare correctly as strings.
pub fn schema_with_meta(schema: &StoreSchema) -> StoreSchema {
    let mut extended = schema.clone();
    extended.insert("id".to_string(), FieldType::Str);
    extended.insert("user_id".to_string(), FieldType::Str);
    extended.insert("created_at".to_string(), FieldType::Str);
    extended.insert("updated_at".to_string(), FieldType::Str);
    extended
}

/// Validate filters against the schema and build the WHERE clause. The
/// user_id predicate is always present, filters or not.
pub fn build_where_clause(
    store: &str,
    schema: &StoreSchema,
    user_id: &str,
    filters: &Filters,
) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut clauses = vec!["user_id = ?".to_string()];
    let mut params = vec![SqlValue::Text(user_id.to_string())];

    if filters.is_empty() {
        return Ok(("WHERE user_id = ?".to_string(), params));
    }

    let extended = schema_with_meta(schema);

    for (field, condition) in filters {
        let field_type = *extended.get(field.as_str()).ok_or_else(|| {
            StoreError::Validation(format!(
                "invalid filter field '{field}' for store '{store}'"
            ))
        })?;
        let field = validate_field_name(field)?;

        match condition {
            FilterCondition::Equals(value) => {
                let serialized = serialize_value(Some(value), field_type, field, store)?;
                clauses.push(format!("\"{field}\" = ?"));
                params.push(serialized);
            }
            FilterCondition::Ops(ops) => {
                for (op, value) in ops {
                    let serialized = match op {
                        // LIKE patterns carry wildcards that are not valid
                        // for the declared type; pass the text through.
                        FilterOp::Like => match value {
                            Value::String(s) => SqlValue::Text(s.clone()),
                            other => SqlValue::Text(other.to_string()),
                        },
                        _ => serialize_value(Some(value), field_type, field, store)?,
                    };
                    clauses.push(format!("\"{field}\" {} ?", op.sql()));
                    params.push(serialized);
                }
            }
        }
    }

    Ok((format!("WHERE {}", clauses.join(" AND ")), params))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StoreSchema {
        let mut s = StoreSchema::new();
        s.insert("title".to_string(), FieldType::Str);
        s.insert("score".to_string(), FieldType::Int);
        s
    }

    #[test]
    fn no_filters_still_pins_user_id() {
        let (sql, params) = build_where_clause("t", &schema(), "u1", &Filters::new()).unwrap();
        assert_eq!(sql, "WHERE user_id = ?");
        assert_eq!(params, vec![SqlValue::Text("u1".into())]);
    }

    #[test]
    fn exact_match_and_operators_combine() {
        let mut filters = Filters::new();
        filters.insert("title".into(), FilterCondition::Equals(json!("hello")));
        let mut ops = BTreeMap::new();
        ops.insert(FilterOp::Gt, json!(3));
        ops.insert(FilterOp::Lte, json!(9));
        filters.insert("score".into(), FilterCondition::Ops(ops));

        let (sql, params) = build_where_clause("t", &schema(), "u1", &filters).unwrap();
        assert!(sql.contains("user_id = ?"));
        assert!(sql.contains("\"score\" > ?"));
        assert!(sql.contains("\"score\" <= ?"));
        assert!(sql.contains("\"title\" = ?"));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn unknown_filter_field_is_rejected() {
        let mut filters = Filters::new();
        filters.insert("nope".into(), FilterCondition::Equals(json!(1)));
        assert!(matches!(
            build_where_clause("t", &schema(), "u1", &filters),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn system_columns_are_filterable() {
        let mut filters = Filters::new();
        let mut ops = BTreeMap::new();
        ops.insert(FilterOp::Gte, json!("2024-01-01"));
        filters.insert("created_at".into(), FilterCondition::Ops(ops));
        assert!(build_where_clause("t", &schema(), "u1", &filters).is_ok());
    }

    #[test]
    fn like_passes_pattern_text_through() {
        let mut filters = Filters::new();
        let mut ops = BTreeMap::new();
        ops.insert(FilterOp::Like, json!("%foo%"));
        filters.insert("title".into(), FilterCondition::Ops(ops));
        let (_, params) = build_where_clause("t", &schema(), "u1", &filters).unwrap();
        assert_eq!(params[1], SqlValue::Text("%foo%".into()));
    }

    #[test]
    fn pagination_validates_bounds() {
        let (sql, params) = build_pagination_clause(Page { limit: Some(10), offset: 20 }).unwrap();
        assert_eq!(sql, "LIMIT ? OFFSET ?");
        assert_eq!(params, vec![SqlValue::Int(10), SqlValue::Int(20)]);

        let (sql, _) = build_pagination_clause(Page::default()).unwrap();
        assert_eq!(sql, "");

        assert!(build_pagination_clause(Page { limit: Some(-1), offset: 0 }).is_err());
        assert!(build_pagination_clause(Page { limit: None, offset: -5 }).is_err());
    }

    #[test]
    fn filter_condition_deserializes_operator_maps() {
        let cond: FilterCondition = serde_json::from_value(json!({"$like": "%x%"})).unwrap();
        assert!(matches!(cond, FilterCondition::Ops(_)));
        let cond: FilterCondition = serde_json::from_value(json!("plain")).unwrap();
        assert!(matches!(cond, FilterCondition::Equals(_)));
    }
}
