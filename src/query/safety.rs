use serde_json::{Map, Value, json};

use crate::engine::filter::truthy;

/// Adds `_type: {$type: 2}` to `filter` unless it provably excludes
/// tombstones. A filter that already mentions `_type` is left alone.
pub fn make_query_safe(filter: &mut Map<String, Value>) {
    if filter.contains_key("_type") {
        return;
    }
    if tombstone_could_match(filter, true) {
        filter.insert("_type".to_string(), json!({ "$type": 2 }));
    }
}

/// True unless `filter` provably rejects a row whose only fields are
/// bookkeeping fields and a null `_type`.
///
/// `$or` is analysed only when `top_level` is set; a nested `$or` counts as
/// possibly matching.
pub fn tombstone_could_match(filter: &Map<String, Value>, top_level: bool) -> bool {
    let mut excluded = false;
    for (key, value) in filter {
        match key.as_str() {
            "$and" => match object_members(value) {
                Some(members) => {
                    if members.iter().any(|m| !tombstone_could_match(m, false)) {
                        excluded = true;
                    }
                }
                None => return true,
            },
            "$or" => match object_members(value) {
                Some(members) => {
                    if top_level
                        && !members.is_empty()
                        && members.iter().all(|m| !tombstone_could_match(m, false))
                    {
                        excluded = true;
                    }
                }
                None => return true,
            },
            "$nor" => {
                if object_members(value).is_none() {
                    return true;
                }
            }
            k if k.starts_with('$') => {}
            k if is_bookkeeping(k) => {}
            _ => {
                if clause_excludes(value) {
                    excluded = true;
                }
            }
        }
    }
    !excluded
}

fn object_members(value: &Value) -> Option<Vec<&Map<String, Value>>> {
    match value {
        Value::Array(items) => items.iter().map(Value::as_object).collect(),
        _ => None,
    }
}

fn is_bookkeeping(field: &str) -> bool {
    matches!(field, "_id" | "_v" | "_o" | "_m") || field.starts_with("_m.")
}

fn clause_excludes(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, arg)| operator_excludes(op, arg))
        }
        _ => true,
    }
}

fn operator_excludes(op: &str, arg: &Value) -> bool {
    match op {
        "$ne" => arg.is_null(),
        "$eq" | "$gt" | "$gte" | "$lt" | "$lte" => !arg.is_null(),
        "$exists" => truthy(arg),
        "$in" => matches!(arg, Value::Array(items) if !items.iter().any(Value::is_null)),
        _ => false,
    }
}
