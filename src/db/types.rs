//! Row decoding into backend-neutral values.
//!
//! Query callbacks receive rows as `serde_json::Map` values so callers never
//! touch driver-specific row types. Decoding classifies the column's declared
//! type into a coarse category, then extracts with the matching Rust type.
//! Values that fail to decode become JSON null rather than erroring the whole
//! row.

use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, TypeInfo};

/// A decoded result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Binary,
    Text,
}

fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower.contains("decimal")
        || lower.contains("numeric")
    {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    // varchar, text, char, date, time and everything else read as text
    TypeCategory::Text
}

fn binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

macro_rules! decode_row_impl {
    ($fn_name:ident, $row_ty:ty) => {
        pub(crate) fn $fn_name(row: &$row_ty) -> Row {
            row.columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    let category = categorize_type(col.type_info().name());
                    let value = match category {
                        TypeCategory::Integer => row
                            .try_get::<Option<i64>, _>(idx)
                            .ok()
                            .flatten()
                            .map(|v| JsonValue::Number(v.into()))
                            .unwrap_or(JsonValue::Null),
                        TypeCategory::Boolean => row
                            .try_get::<Option<bool>, _>(idx)
                            .ok()
                            .flatten()
                            .map(JsonValue::Bool)
                            .unwrap_or(JsonValue::Null),
                        TypeCategory::Float => row
                            .try_get::<Option<f64>, _>(idx)
                            .ok()
                            .flatten()
                            .map(float_value)
                            .unwrap_or(JsonValue::Null),
                        TypeCategory::Binary => row
                            .try_get::<Option<Vec<u8>>, _>(idx)
                            .ok()
                            .flatten()
                            .map(|v| binary_value(&v))
                            .unwrap_or(JsonValue::Null),
                        TypeCategory::Text => match row.try_get::<Option<String>, _>(idx) {
                            Ok(v) => v.map(JsonValue::String).unwrap_or(JsonValue::Null),
                            // Expression columns can carry no declared type
                            // and land here; try the numeric decodes before
                            // giving up on the cell.
                            Err(_) => row
                                .try_get::<Option<i64>, _>(idx)
                                .ok()
                                .flatten()
                                .map(|v| JsonValue::Number(v.into()))
                                .or_else(|| {
                                    row.try_get::<Option<f64>, _>(idx)
                                        .ok()
                                        .flatten()
                                        .map(float_value)
                                })
                                .unwrap_or(JsonValue::Null),
                        },
                    };
                    (col.name().to_string(), value)
                })
                .collect()
        }
    };
}

decode_row_impl!(decode_sqlite_row, SqliteRow);
decode_row_impl!(decode_mysql_row, MySqlRow);
decode_row_impl!(decode_postgres_row, PgRow);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_integer() {
        assert_eq!(categorize_type("INTEGER"), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT"), TypeCategory::Integer);
        assert_eq!(categorize_type("serial"), TypeCategory::Integer);
    }

    #[test]
    fn test_categorize_float() {
        assert_eq!(categorize_type("DOUBLE"), TypeCategory::Float);
        assert_eq!(categorize_type("REAL"), TypeCategory::Float);
        assert_eq!(categorize_type("DECIMAL"), TypeCategory::Float);
    }

    #[test]
    fn test_categorize_boolean_and_binary() {
        assert_eq!(categorize_type("BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("BLOB"), TypeCategory::Binary);
        assert_eq!(categorize_type("bytea"), TypeCategory::Binary);
    }

    #[test]
    fn test_categorize_text_fallback() {
        assert_eq!(categorize_type("VARCHAR(36)"), TypeCategory::Text);
        assert_eq!(categorize_type("TIMESTAMP"), TypeCategory::Text);
        assert_eq!(categorize_type("TEXT"), TypeCategory::Text);
    }

    #[test]
    fn test_binary_value_base64() {
        assert_eq!(
            binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
    }

    #[test]
    fn test_float_value_non_finite() {
        // NaN has no JSON number representation; falls back to a string
        assert_eq!(float_value(f64::NAN), JsonValue::String("NaN".to_string()));
        assert_eq!(float_value(2.5), serde_json::json!(2.5));
    }
}
