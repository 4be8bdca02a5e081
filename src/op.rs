//! Operation model and the stored op-log record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{DocId, OpId, Row, Version};

/// Stored op row field holding the document id.
pub const DOC_FIELD: &str = "d";
/// Stored op row field holding the version the op applies to.
pub const VERSION_FIELD: &str = "v";
/// Stored op row field holding the link to the previous op.
pub const LINK_FIELD: &str = "o";

/// One path segment of an edit component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Object key.
    Key(String),
    /// Array index.
    Index(u64),
}

impl PathSegment {
    /// Returns the segment as it would be named in a field path.
    pub fn as_field(&self) -> String {
        match self {
            Self::Key(key) => key.clone(),
            Self::Index(idx) => idx.to_string(),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<u64> for PathSegment {
    fn from(value: u64) -> Self {
        Self::Index(value)
    }
}

/// A single edit component; the body is opaque to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpComponent {
    /// Path from the document root to the edited location.
    pub p: Vec<PathSegment>,
    /// Type-specific edit payload.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl OpComponent {
    /// Builds a component at `path` carrying `body`.
    pub fn new<I, S>(path: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathSegment>,
    {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            p: path.into_iter().map(Into::into).collect(),
            body,
        }
    }
}

/// Payload of a create operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOp {
    /// OT type name of the created document.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Initial document data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// What an operation does to its document.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Creates the document.
    Create(CreateOp),
    /// Applies edit components.
    Edit(Vec<OpComponent>),
    /// Deletes the document, leaving a tombstone.
    Delete,
    /// Carries no change; only advances the version.
    Noop,
}

/// An operation as submitted by the OT server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireOp", into = "WireOp")]
pub struct Op {
    /// Version of the document the op applies to.
    pub v: Option<Version>,
    /// Submitting client id.
    pub src: Option<String>,
    /// Client-local sequence number.
    pub seq: Option<u64>,
    /// The change itself.
    pub kind: OpKind,
    /// Op metadata.
    pub m: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create: Option<CreateOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<Vec<OpComponent>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    del: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    m: Option<Value>,
}

impl From<WireOp> for Op {
    fn from(wire: WireOp) -> Self {
        let kind = if let Some(create) = wire.create {
            OpKind::Create(create)
        } else if wire.del {
            OpKind::Delete
        } else if let Some(components) = wire.op {
            OpKind::Edit(components)
        } else {
            OpKind::Noop
        };
        Self {
            v: wire.v,
            src: wire.src,
            seq: wire.seq,
            kind,
            m: wire.m,
        }
    }
}

impl From<Op> for WireOp {
    fn from(op: Op) -> Self {
        let mut wire = WireOp {
            v: op.v,
            src: op.src,
            seq: op.seq,
            m: op.m,
            ..WireOp::default()
        };
        match op.kind {
            OpKind::Create(create) => wire.create = Some(create),
            OpKind::Edit(components) => wire.op = Some(components),
            OpKind::Delete => wire.del = true,
            OpKind::Noop => {}
        }
        wire
    }
}

impl Op {
    fn with_kind(v: Version, kind: OpKind) -> Self {
        Self {
            v: Some(v),
            src: None,
            seq: None,
            kind,
            m: None,
        }
    }

    /// Create op at version `v`.
    pub fn create(v: Version, type_name: impl Into<String>, data: Value) -> Self {
        Self::with_kind(
            v,
            OpKind::Create(CreateOp {
                type_name: Some(type_name.into()),
                data: Some(data),
            }),
        )
    }

    /// Edit op at version `v`.
    pub fn edit(v: Version, components: Vec<OpComponent>) -> Self {
        Self::with_kind(v, OpKind::Edit(components))
    }

    /// Delete op at version `v`.
    pub fn delete(v: Version) -> Self {
        Self::with_kind(v, OpKind::Delete)
    }

    /// No-op at version `v`.
    pub fn noop(v: Version) -> Self {
        Self::with_kind(v, OpKind::Noop)
    }

    /// Tags the op with its submitting client and sequence number.
    pub fn with_source(mut self, src: impl Into<String>, seq: u64) -> Self {
        self.src = Some(src.into());
        self.seq = Some(seq);
        self
    }

    /// Attaches metadata.
    pub fn with_meta(mut self, m: Value) -> Self {
        self.m = Some(m);
        self
    }

    /// True for create ops.
    pub fn is_create(&self) -> bool {
        matches!(self.kind, OpKind::Create(_))
    }

    /// True for delete ops.
    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete)
    }

    /// Edit components, or `None` for create, delete and no-op.
    pub fn components(&self) -> Option<&[OpComponent]> {
        match &self.kind {
            OpKind::Edit(components) => Some(components),
            _ => None,
        }
    }
}

/// Error decoding a stored op row.
#[derive(Debug, thiserror::Error)]
pub enum OpRowError {
    /// A bookkeeping field is absent or has the wrong type.
    #[error("op row field `{0}` missing or malformed")]
    Field(&'static str),
    /// The op body failed to decode.
    #[error("op row body: {0}")]
    Body(#[from] serde_json::Error),
}

/// An op as persisted in the op log of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    /// Unique id of this record.
    pub id: OpId,
    /// Document the op belongs to.
    pub doc_id: DocId,
    /// Version the op applies to.
    pub v: Version,
    /// The op record that was last applied before this one.
    pub op_link: Option<OpId>,
    /// The op body.
    pub op: Op,
}

impl OpRecord {
    /// Encodes the record as a stored row.
    pub fn to_row(&self) -> Result<Row, serde_json::Error> {
        let mut row = match serde_json::to_value(&self.op)? {
            Value::Object(map) => map,
            _ => Row::new(),
        };
        row.insert("_id".to_string(), Value::String(self.id.to_string()));
        row.insert(DOC_FIELD.to_string(), Value::String(self.doc_id.clone()));
        row.insert(VERSION_FIELD.to_string(), Value::from(self.v));
        row.insert(
            LINK_FIELD.to_string(),
            self.op_link
                .map(|link| Value::String(link.to_string()))
                .unwrap_or(Value::Null),
        );
        Ok(row)
    }

    /// Decodes a stored row.
    pub fn from_row(mut row: Row) -> Result<Self, OpRowError> {
        let id = row
            .remove("_id")
            .and_then(|v| v.as_str().and_then(|s| s.parse::<OpId>().ok()))
            .ok_or(OpRowError::Field("_id"))?;
        let doc_id = match row.remove(DOC_FIELD) {
            Some(Value::String(d)) => d,
            _ => return Err(OpRowError::Field(DOC_FIELD)),
        };
        let v = row
            .get(VERSION_FIELD)
            .and_then(Value::as_u64)
            .ok_or(OpRowError::Field(VERSION_FIELD))?;
        let op_link = match row.remove(LINK_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse::<OpId>().map_err(|_| OpRowError::Field(LINK_FIELD))?),
            Some(_) => return Err(OpRowError::Field(LINK_FIELD)),
        };
        let op: Op = serde_json::from_value(Value::Object(row))?;
        Ok(Self {
            id,
            doc_id,
            v,
            op_link,
            op,
        })
    }
}
