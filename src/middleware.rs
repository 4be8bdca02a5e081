//! Hooks run before snapshot writes and lookups.

use hashbrown::HashMap;
use serde_json::{Map, Value};

use crate::{op::Op, types::Row};

/// Point at which middleware runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareAction {
    /// Before the first snapshot of a document is inserted.
    BeforeCreate,
    /// Before an existing snapshot is replaced.
    BeforeOverwrite,
    /// Before snapshots are read by id.
    BeforeSnapshotLookup,
}

/// Error raised by a middleware function; aborts the triggering call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("middleware rejected request: {message}")]
pub struct MiddlewareError {
    /// Caller-facing description.
    pub message: String,
    /// Optional caller-defined code.
    pub code: Option<u16>,
}

impl MiddlewareError {
    /// Error without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

/// What the middleware sees and may rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareRequest {
    /// Triggering action.
    pub action: MiddlewareAction,
    /// Snapshot collection.
    pub collection: String,
    /// Snapshot row about to be written.
    pub doc: Option<Row>,
    /// Op being committed.
    pub op: Option<Op>,
    /// Lookup filter; empty for writes.
    pub filter: Map<String, Value>,
}

impl MiddlewareRequest {
    /// Request for a snapshot write.
    pub fn write(action: MiddlewareAction, collection: &str, doc: Row, op: &Op) -> Self {
        Self {
            action,
            collection: collection.to_string(),
            doc: Some(doc),
            op: Some(op.clone()),
            filter: Map::new(),
        }
    }

    /// Request for a snapshot lookup.
    pub fn lookup(collection: &str, filter: Map<String, Value>) -> Self {
        Self {
            action: MiddlewareAction::BeforeSnapshotLookup,
            collection: collection.to_string(),
            doc: None,
            op: None,
            filter,
        }
    }
}

type MiddlewareFn = Box<dyn Fn(MiddlewareRequest) -> Result<MiddlewareRequest, MiddlewareError> + Send + Sync>;

/// Ordered middleware per action.
#[derive(Default)]
pub struct MiddlewareChain {
    fns: HashMap<MiddlewareAction, Vec<MiddlewareFn>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<_> = self.fns.iter().map(|(action, fns)| (*action, fns.len())).collect();
        f.debug_struct("MiddlewareChain").field("registered", &counts).finish()
    }
}

impl MiddlewareChain {
    /// Appends `f` to the functions run for `action`.
    pub fn register<F>(&mut self, action: MiddlewareAction, f: F)
    where
        F: Fn(MiddlewareRequest) -> Result<MiddlewareRequest, MiddlewareError> + Send + Sync + 'static,
    {
        self.fns.entry(action).or_default().push(Box::new(f));
    }

    /// Runs every function registered for the request's action in order,
    /// stopping at the first error.
    pub fn run(&self, request: MiddlewareRequest) -> Result<MiddlewareRequest, MiddlewareError> {
        let Some(fns) = self.fns.get(&request.action) else {
            return Ok(request);
        };
        fns.iter().try_fold(request, |req, f| f(req))
    }
}
