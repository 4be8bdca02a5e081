//! Conversion between snapshots and stored rows.

use serde_json::Value;

use crate::{
    engine::Projection,
    snapshot::Snapshot,
    types::{DATA_FIELD, ID_FIELD, META_FIELD, OP_LINK_FIELD, OpId, Row, TYPE_FIELD, VERSION_FIELD},
};

use super::store::DbError;

/// Encodes `snapshot` as a row whose `_o` is `op_link`.
///
/// Object data is stored at the top level so that queries can address its
/// fields; any other data is stored under `_data`.
pub fn snapshot_to_row(snapshot: &Snapshot, op_link: Option<OpId>) -> Row {
    let mut row = match &snapshot.data {
        Some(Value::Object(fields)) => fields.clone(),
        other => {
            let mut row = Row::new();
            row.insert(DATA_FIELD.to_string(), other.clone().unwrap_or(Value::Null));
            row
        }
    };
    row.insert(ID_FIELD.to_string(), Value::String(snapshot.id.clone()));
    row.insert(
        TYPE_FIELD.to_string(),
        snapshot.type_name.clone().map(Value::String).unwrap_or(Value::Null),
    );
    row.insert(VERSION_FIELD.to_string(), Value::from(snapshot.v));
    if let Some(m) = &snapshot.m {
        row.insert(META_FIELD.to_string(), m.clone());
    }
    row.insert(
        OP_LINK_FIELD.to_string(),
        op_link.map(|id| Value::String(id.to_string())).unwrap_or(Value::Null),
    );
    row
}

/// Decodes a snapshot row, whole or projected.
pub fn row_to_snapshot(mut row: Row) -> Result<Snapshot, DbError> {
    let id = match row.remove(ID_FIELD) {
        Some(Value::String(id)) => id,
        _ => return Err(DbError::CorruptSnapshot("`_id` missing or not a string".to_string())),
    };
    let v = match row.remove(VERSION_FIELD) {
        None | Some(Value::Null) => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| DbError::CorruptSnapshot(format!("{id}: `_v` is not a version")))?,
    };
    let type_name = match row.remove(TYPE_FIELD) {
        Some(Value::String(t)) => Some(t),
        _ => None,
    };
    let op_link = link_from(row.remove(OP_LINK_FIELD));
    let m = row.remove(META_FIELD).filter(|m| !m.is_null());

    let data = if type_name.is_none() {
        None
    } else if let Some(data) = row.remove(DATA_FIELD) {
        Some(data)
    } else {
        Some(Value::Object(row))
    };

    Ok(Snapshot {
        id,
        v,
        type_name,
        data,
        m,
        op_link,
    })
}

/// Parses a stored op link.
pub fn link_from(value: Option<Value>) -> Option<OpId> {
    value.and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
}

/// Projection for snapshot reads.
///
/// `_o` is always read so that returned snapshots carry their op link.
pub fn snapshot_projection(fields: Option<&[String]>, metadata: bool) -> Projection {
    match fields {
        None if metadata => Projection::All,
        None => Projection::Exclude(vec![META_FIELD.to_string()]),
        Some(fields) => {
            let mut include: Vec<String> = fields.to_vec();
            include.extend([TYPE_FIELD, VERSION_FIELD, OP_LINK_FIELD].map(str::to_string));
            if metadata {
                include.push(META_FIELD.to_string());
            }
            Projection::Include(include)
        }
    }
}

/// Projection for op reads.
pub fn op_projection(metadata: bool) -> Projection {
    if metadata {
        Projection::All
    } else {
        Projection::Exclude(vec!["m".to_string()])
    }
}

