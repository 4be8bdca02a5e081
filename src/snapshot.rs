//! Materialized document snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DocId, OpId, Version};

/// Document state at a version. A snapshot without a type is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document id.
    pub id: DocId,
    /// Number of ops applied.
    pub v: Version,
    /// OT type name; `None` for missing or deleted documents.
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    /// Document data.
    pub data: Option<Value>,
    /// Snapshot metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Value>,
    /// Id of the last op applied to reach this snapshot.
    #[serde(skip)]
    pub op_link: Option<OpId>,
}

impl Snapshot {
    /// Snapshot returned for a document that has never been written.
    pub fn missing(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            v: 0,
            type_name: None,
            data: None,
            m: None,
            op_link: None,
        }
    }

    /// Live snapshot.
    pub fn new(id: impl Into<DocId>, v: Version, type_name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            v,
            type_name: Some(type_name.into()),
            data: Some(data),
            m: None,
            op_link: None,
        }
    }

    /// Tombstone left by a delete.
    pub fn tombstone(id: impl Into<DocId>, v: Version) -> Self {
        Self {
            v,
            ..Self::missing(id)
        }
    }

    /// Sets the link to the op that produced the previous version.
    pub fn with_op_link(mut self, op_link: Option<OpId>) -> Self {
        self.op_link = op_link;
        self
    }

    /// Attaches metadata.
    pub fn with_meta(mut self, m: Value) -> Self {
        self.m = Some(m);
        self
    }

    /// True when the document has been deleted or never created.
    pub fn is_tombstone(&self) -> bool {
        self.type_name.is_none()
    }
}
