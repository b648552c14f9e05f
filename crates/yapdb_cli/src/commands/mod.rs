//! CLI command implementations.

pub mod checkpoint;
pub mod dump;
pub mod inspect;
pub mod verify;
pub mod wal;

use std::path::Path;
use yapdb_core::{CorruptAction, Database, DatabaseOptions, Value};

/// Boxed error type shared by every command.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens an existing database without ever recreating it.
///
/// Automatic checkpoints are disabled so that read-only commands leave the
/// files untouched.
pub fn open_existing(path: &Path) -> CliResult<Database> {
    let options = DatabaseOptions::default()
        .create_if_missing(false)
        .corrupt_action(CorruptAction::Fail)
        .auto_checkpoint_interval(0);
    Ok(Database::open(path, options)?)
}

/// Converts a stored value into JSON.
///
/// Map keys that are not strings are rendered through their debug form, and
/// byte strings become arrays of numbers.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            let wide = i128::from(*i);
            if let Ok(n) = i64::try_from(wide) {
                Json::from(n)
            } else if let Ok(n) = u64::try_from(wide) {
                Json::from(n)
            } else {
                Json::String(wide.to_string())
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        Value::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::Text(s) => s.clone(),
                        other => format!("{other:?}"),
                    };
                    (key, value_to_json(v))
                })
                .collect(),
        ),
        Value::Tag(tag, inner) => serde_json::json!({ "tag": tag, "value": value_to_json(inner) }),
        _ => Json::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_convert() {
        let value = Value::Map(vec![
            (Value::from("title"), Value::from("hello")),
            (Value::from(1), Value::Array(vec![Value::from(-3), Value::Null])),
            (Value::from("raw"), Value::Bytes(vec![1, 2])),
        ]);
        let json = value_to_json(&value);
        assert_eq!(json["title"], "hello");
        assert_eq!(json.as_object().map(serde_json::Map::len), Some(3));
        assert_eq!(json["raw"], serde_json::json!([1, 2]));
    }

    #[test]
    fn missing_database_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(open_existing(&path).is_err());
        assert!(!path.exists());
    }
}
