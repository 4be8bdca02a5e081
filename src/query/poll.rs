use hashbrown::HashSet;
use serde_json::{Map, Value};

use super::{ParsedQuery, parse_query};
use crate::op::Op;

/// True if applying `op` cannot change the result set of `query`.
pub fn skip_poll(op: &Op, query: &Value) -> bool {
    if op.is_create() || op.is_delete() {
        return false;
    }
    let Some(components) = op.components() else {
        return true;
    };
    let Ok(parsed) = parse_query(query) else {
        return false;
    };
    if parsed.collection_operation.is_some() || parsed.cursor_operation.is_some() {
        return false;
    }

    let fields = get_fields(&parsed);
    !components.iter().any(|c| match c.p.first() {
        None => true,
        Some(head) => fields.contains(head.as_field().as_str()),
    })
}

/// Top-level field names read by the filter or the sort of `parsed`.
pub fn get_fields(parsed: &ParsedQuery) -> HashSet<String> {
    let mut fields = HashSet::new();
    collect_fields(&parsed.filter, &mut fields);
    for (field, _) in &parsed.transforms.sort {
        fields.insert(top_level(field).to_string());
    }
    fields
}

fn collect_fields(clauses: &Map<String, Value>, fields: &mut HashSet<String>) {
    for (key, value) in clauses {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                if let Value::Array(items) = value {
                    for item in items.iter().filter_map(Value::as_object) {
                        collect_fields(item, fields);
                    }
                }
            }
            "$not" => {
                if let Value::Object(inner) = value {
                    collect_fields(inner, fields);
                }
            }
            k if k.starts_with('$') => {}
            k => {
                fields.insert(top_level(k).to_string());
            }
        }
    }
}

fn top_level(field: &str) -> &str {
    field.split('.').next().unwrap_or(field)
}

/// True if `query` can be re-evaluated against a single document.
pub fn can_poll_doc(query: &Value) -> bool {
    match parse_query(query) {
        Ok(parsed) => {
            !parsed.has_paging() && parsed.collection_operation.is_none() && parsed.cursor_operation.is_none()
        }
        Err(_) => false,
    }
}
