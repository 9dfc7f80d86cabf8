//! Result aggregator.
//!
//! Merges per-page extraction results into the single object stored on the
//! parent crawl job. Array-valued fields concatenate across pages and
//! deduplicate by URL keeping the richest record; object and scalar fields
//! keep their first non-null occurrence. When a key appears as an array on
//! one page and a scalar on another, the array wins and the scalars are
//! discarded.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Merge an ordered set of per-page JSON values into one object.
///
/// Non-JSON-container inputs (scalars, nulls) are discarded. Top-level
/// arrays contribute to the `items` key. Empty input produces
/// `{"items": []}`.
pub fn merge_page_results(pages: &[Value]) -> Value {
    let mut array_fields: Vec<(String, Vec<Value>)> = Vec::new();
    let mut first_fields: Map<String, Value> = Map::new();
    let mut saw_container = false;

    for page in pages {
        match page {
            Value::Object(obj) => {
                saw_container = true;
                for (key, value) in obj {
                    match value {
                        Value::Array(items) => {
                            push_array_items(&mut array_fields, key, items.clone());
                        }
                        Value::Null => {}
                        other => {
                            // Scalars and objects: first non-null occurrence
                            // wins, and only if the key never appears as an
                            // array anywhere.
                            if !first_fields.contains_key(key) {
                                first_fields.insert(key.clone(), other.clone());
                            }
                        }
                    }
                }
            }
            Value::Array(items) => {
                saw_container = true;
                push_array_items(&mut array_fields, "items", items.clone());
            }
            _ => {}
        }
    }

    if !saw_container {
        let mut out = Map::new();
        out.insert("items".to_string(), Value::Array(Vec::new()));
        return Value::Object(out);
    }

    let mut out = Map::new();
    for (key, items) in array_fields {
        // Array wins over scalar occurrences of the same key.
        first_fields.remove(&key);
        out.insert(key, Value::Array(dedupe_by_url(items)));
    }
    for (key, value) in first_fields {
        out.insert(key, value);
    }
    Value::Object(out)
}

fn push_array_items(fields: &mut Vec<(String, Vec<Value>)>, key: &str, items: Vec<Value>) {
    if let Some((_, existing)) = fields.iter_mut().find(|(k, _)| k == key) {
        existing.extend(items);
    } else {
        fields.push((key.to_string(), items));
    }
}

/// URL-keyed deduplication.
///
/// Items with a non-empty string `url` field collide by URL; the survivor
/// is the one with more non-null fields, first seen winning ties. Items
/// without a URL deduplicate by stable serialization.
fn dedupe_by_url(items: Vec<Value>) -> Vec<Value> {
    // Key -> index into `out`, so order stays first-seen.
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Value> = Vec::new();

    for item in items {
        let key = match item_url(&item) {
            Some(url) => format!("url:{url}"),
            None => format!("json:{}", canonical_string(&item)),
        };
        match index.get(&key) {
            None => {
                index.insert(key, out.len());
                out.push(item);
            }
            Some(&at) => {
                if non_null_field_count(&item) > non_null_field_count(&out[at]) {
                    out[at] = item;
                }
            }
        }
    }
    out
}

fn item_url(item: &Value) -> Option<&str> {
    item.as_object()
        .and_then(|o| o.get("url"))
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
}

fn non_null_field_count(item: &Value) -> usize {
    match item {
        Value::Object(obj) => obj.values().filter(|v| !v.is_null()).count(),
        _ => 0,
    }
}

/// Serialization with recursively sorted keys, usable as an equality key.
fn canonical_string(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(obj) => {
                let sorted: std::collections::BTreeMap<&String, Value> =
                    obj.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}
