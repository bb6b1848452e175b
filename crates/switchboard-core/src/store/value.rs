use crate::store::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Closed set of field types a store schema may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Json,
    JsonCollection,
}

impl FieldType {
    /// SQL column type for this field.
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Str | FieldType::Json | FieldType::JsonCollection => "TEXT",
            FieldType::Int | FieldType::Bool => "INTEGER",
            FieldType::Float => "REAL",
        }
    }

    /// Whether the field participates in the FTS index.
    pub fn is_indexable(self) -> bool {
        matches!(
            self,
            FieldType::Str | FieldType::Json | FieldType::JsonCollection
        )
    }
}

/// A store schema: field name → field type. BTreeMap keeps SQL generation
/// deterministic.
pub type StoreSchema = BTreeMap<String, FieldType>;

/// A value ready for parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

/// Bind a [`SqlValue`] onto a query, threading the builder through.
pub fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: SqlValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Int(i) => query.bind(i),
        SqlValue::Real(f) => query.bind(f),
        SqlValue::Text(s) => query.bind(s),
    }
}

fn mismatch(store: &str, field: &str, message: impl Into<String>) -> StoreError {
    StoreError::TypeMismatch {
        store: store.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

/// Convert a caller-supplied JSON value into its storage representation for
/// the declared field type. `None` and JSON null both store as NULL.
///
/// json_collection fields are never set through this path: the column only
/// ever holds the metadata object maintained by `collection_append`.
pub fn serialize_value(
    value: Option<&Value>,
    field_type: FieldType,
    field: &str,
    store: &str,
) -> Result<SqlValue, StoreError> {
    let value = match value {
        None | Some(Value::Null) => return Ok(SqlValue::Null),
        Some(v) => v,
    };

    match field_type {
        FieldType::Str => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            _ => Err(mismatch(store, field, "cannot coerce object/array to str")),
        },
        FieldType::Int => match value {
            Value::Bool(_) => Err(mismatch(store, field, "bool is not a valid int")),
            Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Int)
                .ok_or_else(|| mismatch(store, field, "number is not an integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(SqlValue::Int)
                .map_err(|_| mismatch(store, field, format!("cannot convert '{s}' to int"))),
            _ => Err(mismatch(store, field, "cannot convert value to int")),
        },
        FieldType::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| mismatch(store, field, "number is not representable as float")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(SqlValue::Real)
                .map_err(|_| mismatch(store, field, format!("cannot convert '{s}' to float"))),
            Value::Bool(_) => Err(mismatch(store, field, "bool is not a valid float")),
            _ => Err(mismatch(store, field, "cannot convert value to float")),
        },
        FieldType::Bool => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "false" | "0" | "" => false,
                    _ => true,
                },
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                Value::Null => false,
            };
            Ok(SqlValue::Int(i64::from(truthy)))
        }
        FieldType::Json => match value {
            Value::Object(_) | Value::Array(_) => Ok(SqlValue::Text(
                serde_json::to_string(value)
                    .map_err(|e| mismatch(store, field, format!("not JSON-serializable: {e}")))?,
            )),
            Value::String(s) => {
                if s.is_empty() {
                    return Err(StoreError::Validation(format!(
                        "empty string is not valid JSON for field '{field}' in store '{store}'"
                    )));
                }
                // Validate by parsing but store the original text so key
                // order survives a round-trip.
                serde_json::from_str::<Value>(s)
                    .map_err(|e| mismatch(store, field, format!("invalid JSON string: {e}")))?;
                Ok(SqlValue::Text(s.clone()))
            }
            _ => Err(mismatch(store, field, "json field takes object, array, or JSON text")),
        },
        FieldType::JsonCollection => Err(mismatch(
            store,
            field,
            "json_collection fields cannot be set directly; use collection_append",
        )),
    }
}

/// Convert a stored value back to JSON according to the declared type.
/// Unparseable stored JSON is logged and returned raw rather than failing
/// the whole read.
pub fn deserialize_value(raw: SqlValue, field_type: FieldType) -> Value {
    match (field_type, raw) {
        (_, SqlValue::Null) => Value::Null,
        (FieldType::Bool, SqlValue::Int(i)) => Value::Bool(i != 0),
        (FieldType::Int, SqlValue::Int(i)) => Value::from(i),
        (FieldType::Float, SqlValue::Real(f)) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        (FieldType::Json | FieldType::JsonCollection, SqlValue::Text(s)) => {
            match serde_json::from_str(&s) {
                Ok(v) => v,
                Err(e) => {
                    warn!("stored JSON failed to parse, returning raw text: {e}");
                    Value::String(s)
                }
            }
        }
        (FieldType::Str, SqlValue::Text(s)) => Value::String(s),
        // Stored representation drifted from the schema (e.g. after an
        // external edit); degrade to the raw value.
        (_, SqlValue::Int(i)) => Value::from(i),
        (_, SqlValue::Real(f)) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        (_, SqlValue::Text(s)) => Value::String(s),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ser(v: &Value, t: FieldType) -> Result<SqlValue, StoreError> {
        serialize_value(Some(v), t, "f", "s")
    }

    #[test]
    fn str_coerces_scalars_rejects_containers() {
        assert_eq!(ser(&json!("x"), FieldType::Str).unwrap(), SqlValue::Text("x".into()));
        assert_eq!(ser(&json!(3), FieldType::Str).unwrap(), SqlValue::Text("3".into()));
        assert!(ser(&json!({"a": 1}), FieldType::Str).is_err());
    }

    #[test]
    fn int_rejects_bool_explicitly() {
        assert!(matches!(
            ser(&json!(true), FieldType::Int),
            Err(StoreError::TypeMismatch { .. })
        ));
        assert_eq!(ser(&json!("42"), FieldType::Int).unwrap(), SqlValue::Int(42));
        assert!(ser(&json!("nope"), FieldType::Int).is_err());
        assert!(ser(&json!(1.5), FieldType::Int).is_err());
    }

    #[test]
    fn float_coerces_from_strings_and_numbers() {
        assert_eq!(ser(&json!(2.5), FieldType::Float).unwrap(), SqlValue::Real(2.5));
        assert_eq!(ser(&json!("2.5"), FieldType::Float).unwrap(), SqlValue::Real(2.5));
        assert!(ser(&json!("abc"), FieldType::Float).is_err());
    }

    #[test]
    fn bool_accepts_truthy_falsy() {
        assert_eq!(ser(&json!(true), FieldType::Bool).unwrap(), SqlValue::Int(1));
        assert_eq!(ser(&json!(0), FieldType::Bool).unwrap(), SqlValue::Int(0));
        assert_eq!(ser(&json!("false"), FieldType::Bool).unwrap(), SqlValue::Int(0));
        assert_eq!(ser(&json!("yes"), FieldType::Bool).unwrap(), SqlValue::Int(1));
        assert_eq!(ser(&json!([]), FieldType::Bool).unwrap(), SqlValue::Int(0));
    }

    #[test]
    fn json_preserves_original_text_of_string_input() {
        let text = r#"{"b":1,"a":2}"#;
        assert_eq!(
            ser(&json!(text), FieldType::Json).unwrap(),
            SqlValue::Text(text.to_string())
        );
        assert!(ser(&json!(""), FieldType::Json).is_err());
        assert!(ser(&json!("not json"), FieldType::Json).is_err());
        assert!(ser(&json!({"k": [1, 2]}), FieldType::Json).is_ok());
    }

    #[test]
    fn collection_direct_set_is_forbidden() {
        assert!(ser(&json!([1]), FieldType::JsonCollection).is_err());
    }

    #[test]
    fn none_and_null_store_as_null() {
        assert_eq!(serialize_value(None, FieldType::Str, "f", "s").unwrap(), SqlValue::Null);
        assert_eq!(ser(&Value::Null, FieldType::Int).unwrap(), SqlValue::Null);
    }

    #[test]
    fn deserialize_mirrors_types() {
        assert_eq!(deserialize_value(SqlValue::Int(1), FieldType::Bool), json!(true));
        assert_eq!(deserialize_value(SqlValue::Int(9), FieldType::Int), json!(9));
        assert_eq!(
            deserialize_value(SqlValue::Text(r#"{"a":1}"#.into()), FieldType::Json),
            json!({"a": 1})
        );
    }

    #[test]
    fn corrupt_json_returns_raw_string() {
        assert_eq!(
            deserialize_value(SqlValue::Text("{broken".into()), FieldType::Json),
            json!("{broken")
        );
    }

    #[test]
    fn field_type_serde_names() {
        assert_eq!(serde_json::to_string(&FieldType::JsonCollection).unwrap(), "\"json_collection\"");
        let t: FieldType = serde_json::from_str("\"str\"").unwrap();
        assert_eq!(t, FieldType::Str);
    }
}
