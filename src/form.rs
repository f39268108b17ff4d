//! Flattening of structured values into form fields.

use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;

/// Flattens a serializable value into ordered form fields.
///
/// The top level must serialize to a map. Nested sequences become
/// `key[index]` and nested maps become `key[subkey]`, recursively. `null`
/// values are omitted.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let fields = callweave::form::flatten(&json!({
///     "slice": ["a", "b"],
///     "map": { "k": "v" },
/// }))
/// .unwrap();
///
/// assert!(fields.contains(&("slice[0]".to_string(), "a".to_string())));
/// assert!(fields.contains(&("slice[1]".to_string(), "b".to_string())));
/// assert!(fields.contains(&("map[k]".to_string(), "v".to_string())));
/// ```
pub fn flatten<T: Serialize + ?Sized>(value: &T) -> Result<Vec<(String, String)>> {
    let value =
        serde_json::to_value(value).map_err(|e| Error::SerializationFailed(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(Error::SerializationFailed(
            "form body must serialize to a map".to_string(),
        ));
    };

    let mut fields = Vec::new();
    for (key, value) in map {
        push_field(&mut fields, key, value);
    }
    Ok(fields)
}

/// URL-encodes flattened fields.
pub(crate) fn encode(fields: &[(String, String)]) -> Result<String> {
    serde_urlencoded::to_string(fields).map_err(|e| Error::SerializationFailed(e.to_string()))
}

fn push_field(fields: &mut Vec<(String, String)>, key: String, value: Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => fields.push((key, b.to_string())),
        Value::Number(n) => fields.push((key, n.to_string())),
        Value::String(s) => fields.push((key, s)),
        Value::Array(items) => {
            for (index, item) in items.into_iter().enumerate() {
                push_field(fields, format!("{}[{}]", key, index), item);
            }
        }
        Value::Object(map) => {
            for (sub, item) in map {
                push_field(fields, format!("{}[{}]", key, sub), item);
            }
        }
    }
}
