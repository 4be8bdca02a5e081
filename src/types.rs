//! Shared primitive identifiers and row aliases.

/// Document identifier within a collection.
pub type DocId = String;
/// Document version; the number of operations applied so far.
pub type Version = u64;
/// Identifier of a stored operation record.
pub type OpId = uuid::Uuid;
/// A stored row: a JSON object keyed by field name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Snapshot row field holding the document id.
pub const ID_FIELD: &str = "_id";
/// Snapshot row field holding the type name; null on tombstones.
pub const TYPE_FIELD: &str = "_type";
/// Snapshot row field holding the version.
pub const VERSION_FIELD: &str = "_v";
/// Snapshot row field holding the last-applied op id.
pub const OP_LINK_FIELD: &str = "_o";
/// Snapshot row field holding metadata.
pub const META_FIELD: &str = "_m";
/// Snapshot row field holding non-object document data.
pub const DATA_FIELD: &str = "_data";

/// Returns the op-log collection name for `collection`.
pub fn ops_collection(collection: &str) -> String {
    format!("o_{collection}")
}
