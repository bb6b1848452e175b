use crate::store::error::StoreError;
use regex::Regex;
use std::sync::OnceLock;

fn store_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"))
}

fn field_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("static regex"))
}

/// Validate a store name against the identifier grammar. Validated names are
/// the only identifiers ever interpolated into SQL text; all values go
/// through parameter binding.
pub fn validate_store_name(name: &str) -> Result<&str, StoreError> {
    if store_name_re().is_match(name) {
        Ok(name)
    } else {
        Err(StoreError::Validation(format!(
            "invalid store name '{name}': must match [A-Za-z0-9_-]{{1,64}}"
        )))
    }
}

/// Validate a field name (also used for order_by columns).
pub fn validate_field_name(name: &str) -> Result<&str, StoreError> {
    if field_name_re().is_match(name) {
        Ok(name)
    } else {
        Err(StoreError::Validation(format!(
            "invalid field name '{name}': must match [A-Za-z0-9_]{{1,64}}"
        )))
    }
}

/// Child table backing a json_collection field.
pub fn collection_table_name(store: &str, field: &str) -> String {
    format!("{store}_{field}")
}

/// FTS virtual table for a store.
pub fn fts_table_name(store: &str) -> String {
    format!("fts_{store}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_names_accept_hyphens_fields_do_not() {
        assert!(validate_store_name("Chat-History_1").is_ok());
        assert!(validate_field_name("order_index").is_ok());
        assert!(validate_field_name("bad-field").is_err());
    }

    #[test]
    fn rejects_injection_and_oversized_names() {
        assert!(validate_store_name("threads; DROP TABLE _stores").is_err());
        assert!(validate_store_name("").is_err());
        assert!(validate_field_name(&"a".repeat(65)).is_err());
        assert!(validate_field_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn collection_table_names_compose() {
        assert_eq!(collection_table_name("Threads", "messages"), "Threads_messages");
        assert_eq!(fts_table_name("Threads"), "fts_Threads");
    }
}
