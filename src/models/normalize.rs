//! Response normalization
//!
//! Collapses the list shapes upstream APIs return into one flat list.

use serde_json::Value;

/// Envelope fields searched for a list, in order of precedence.
const LIST_FIELDS: [&str; 3] = ["data", "items", "results"];

/// Extracts the list of records from an upstream response.
///
/// Precedence:
/// 1. a top-level array is the list
/// 2. the first of `data`, `items`, `results` holding an array
/// 3. an object under `data` is unwrapped once and searched the same way
/// 4. any other object is a single record
/// 5. `null` is empty; other scalars are a single record
pub fn normalize_response(response: &Value) -> Vec<Value> {
    normalize(response, true)
}

fn normalize(response: &Value, unwrap_data: bool) -> Vec<Value> {
    match response {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        Value::Object(map) => {
            if let Some(items) = LIST_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_array))
            {
                return items.clone();
            }
            match map.get("data") {
                Some(inner @ Value::Object(_)) if unwrap_data => normalize(inner, false),
                _ => vec![response.clone()],
            }
        }
        scalar => vec![scalar.clone()],
    }
}
