//! Store facade: errors, snapshot reads and queries.

use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
    config::{ReadOptions, StoreConfig},
    engine::{EngineError, FindOptions, Projection, StorageEngine, memory::MemoryEngine, row_key},
    middleware::{MiddlewareAction, MiddlewareChain, MiddlewareError, MiddlewareRequest},
    op::{Op, OpRowError},
    query::{
        CollectionOperation, CursorOperation, ParsedQuery, QueryError, check_policy, parse_query,
        poll, safety::make_query_safe,
    },
    snapshot::Snapshot,
    types::{DocId, ID_FIELD, OP_LINK_FIELD, OpId, Row, VERSION_FIELD, Version},
};

use super::cast::{link_from, row_to_snapshot, snapshot_projection};

/// Failure of a store operation.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The op has no version, or the snapshot version cannot follow one.
    #[error("invalid op version")]
    InvalidOpVersion,
    /// Reserved or op-log collection name.
    #[error("invalid collection name {0}")]
    InvalidCollection(String),
    /// A snapshot that should carry an op link does not.
    #[error("snapshot missing last operation field \"_o\" {collection}.{id}")]
    MissingOpLink {
        /// Snapshot collection.
        collection: String,
        /// Document id.
        id: DocId,
    },
    /// The op chain has a gap at or after `from`.
    #[error("Missing ops from requested version {collection}.{id} {from}")]
    MissingOps {
        /// Snapshot collection.
        collection: String,
        /// Document id.
        id: DocId,
        /// First requested version.
        from: Version,
    },
    /// A stored snapshot row cannot be decoded.
    #[error("corrupt snapshot row: {0}")]
    CorruptSnapshot(String),
    /// A stored op row cannot be decoded.
    #[error("corrupt op row: {0}")]
    CorruptOp(#[from] OpRowError),
    /// The query was rejected.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// Middleware aborted the call.
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    /// The storage engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl DbError {
    /// Stable numeric code, where one is defined.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::InvalidOpVersion => Some(4101),
            Self::InvalidCollection(_) => Some(4102),
            Self::MissingOpLink { .. } => Some(5102),
            Self::MissingOps { .. } => Some(5103),
            Self::Query(err) => Some(err.code()),
            Self::Middleware(err) => err.code,
            Self::CorruptSnapshot(_) | Self::CorruptOp(_) | Self::Engine(_) => None,
        }
    }
}

/// Rows returned by [`DocStore::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Matching snapshots.
    pub snapshots: Vec<Snapshot>,
    /// Computed value of a count, distinct, explain, aggregate or map-reduce.
    pub extra: Option<Value>,
}

/// Ids returned by [`DocStore::query_poll`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResult {
    /// Matching document ids.
    pub ids: Vec<DocId>,
    /// Computed value, as in [`QueryResult::extra`].
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SnapshotLink {
    pub(crate) v: Version,
    pub(crate) op_link: Option<OpId>,
}

/// Rejects names reserved for the store itself.
pub fn validate_collection_name(name: &str) -> Result<(), DbError> {
    if name == "system" || name.starts_with("o_") {
        return Err(DbError::InvalidCollection(name.to_string()));
    }
    Ok(())
}

/// Versioned document store over a [`StorageEngine`].
///
/// Every method is safe to call concurrently; consistency rests on the
/// engine's atomic insert and compare-and-swap.
pub struct DocStore {
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) config: StoreConfig,
    pub(crate) middleware: MiddlewareChain,
}

impl std::fmt::Debug for DocStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStore")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .field("middleware", &self.middleware)
            .finish()
    }
}

impl DocStore {
    /// Store over `engine`.
    pub fn new(engine: Arc<dyn StorageEngine>, config: StoreConfig) -> Self {
        Self {
            engine,
            config,
            middleware: MiddlewareChain::default(),
        }
    }

    /// Store over a fresh [`MemoryEngine`].
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(Arc::new(MemoryEngine::new()), config)
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Backing engine.
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Registers middleware for `action`.
    pub fn use_middleware<F>(&mut self, action: MiddlewareAction, f: F) -> &mut Self
    where
        F: Fn(MiddlewareRequest) -> Result<MiddlewareRequest, MiddlewareError> + Send + Sync + 'static,
    {
        self.middleware.register(action, f);
        self
    }

    pub(crate) fn snapshot_lookup(&self, collection: &str, filter: Map<String, Value>) -> Result<Value, DbError> {
        let request = self.middleware.run(MiddlewareRequest::lookup(collection, filter))?;
        Ok(Value::Object(request.filter))
    }

    /// Current snapshot of `id`; a version-0 typeless snapshot if absent.
    pub fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        fields: Option<&[String]>,
        options: ReadOptions,
    ) -> Result<Snapshot, DbError> {
        validate_collection_name(collection)?;
        let mut filter = Map::new();
        filter.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        let filter = self.snapshot_lookup(collection, filter)?;
        let projection = snapshot_projection(fields, options.metadata);
        match self.engine.find_one(collection, &filter, &projection)? {
            Some(row) => row_to_snapshot(row),
            None => Ok(Snapshot::missing(id)),
        }
    }

    /// Current snapshots of `ids` in one read.
    pub fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[DocId],
        fields: Option<&[String]>,
        options: ReadOptions,
    ) -> Result<HashMap<DocId, Snapshot>, DbError> {
        validate_collection_name(collection)?;
        let mut filter = Map::new();
        filter.insert(ID_FIELD.to_string(), json!({ "$in": ids }));
        let filter = self.snapshot_lookup(collection, filter)?;
        let find = FindOptions::default().with_projection(snapshot_projection(fields, options.metadata));

        let mut out = HashMap::with_capacity(ids.len());
        for row in self.engine.find_many(collection, &filter, &find)? {
            let snapshot = row_to_snapshot(row)?;
            out.insert(snapshot.id.clone(), snapshot);
        }
        for id in ids {
            out.entry(id.clone()).or_insert_with(|| Snapshot::missing(id.clone()));
        }
        Ok(out)
    }

    pub(crate) fn snapshot_links(
        &self,
        collection: &str,
        ids: &[&str],
    ) -> Result<HashMap<DocId, SnapshotLink>, DbError> {
        let mut filter = Map::new();
        filter.insert(ID_FIELD.to_string(), json!({ "$in": ids }));
        let filter = self.snapshot_lookup(collection, filter)?;
        let find = FindOptions::default().with_projection(Projection::Include(vec![
            VERSION_FIELD.to_string(),
            OP_LINK_FIELD.to_string(),
        ]));

        let mut out = HashMap::with_capacity(ids.len());
        for mut row in self.engine.find_many(collection, &filter, &find)? {
            let id = row_key(&row)?;
            let v = row.get(VERSION_FIELD).and_then(Value::as_u64).unwrap_or(0);
            let op_link = link_from(row.remove(OP_LINK_FIELD));
            out.insert(id, SnapshotLink { v, op_link });
        }
        Ok(out)
    }

    pub(crate) fn snapshot_link(&self, collection: &str, id: &str) -> Result<Option<SnapshotLink>, DbError> {
        Ok(self.snapshot_links(collection, &[id])?.remove(id))
    }

    fn prepare_query(&self, query: &Value) -> Result<ParsedQuery, DbError> {
        let mut parsed = parse_query(query)
            .and_then(|parsed| check_policy(&parsed, &self.config).map(|_| parsed))
            .inspect_err(|err| debug!(code = err.code(), error = %err, "query rejected"))?;
        make_query_safe(&mut parsed.filter);
        Ok(parsed)
    }

    fn execute(
        &self,
        collection: &str,
        parsed: &ParsedQuery,
        projection: Projection,
    ) -> Result<(Vec<Row>, Option<Value>), DbError> {
        let filter = Value::Object(parsed.filter.clone());
        if let Some(op) = &parsed.collection_operation {
            let extra = match op {
                CollectionOperation::Distinct { field } => {
                    Value::Array(self.engine.distinct(collection, field, &filter)?)
                }
                CollectionOperation::Aggregate(stages) => {
                    self.engine.aggregate(collection, &Value::Array(stages.clone()))?
                }
                CollectionOperation::MapReduce(spec) => {
                    self.engine.map_reduce(collection, &Value::Object(spec.clone()), &filter)?
                }
            };
            return Ok((Vec::new(), Some(extra)));
        }

        let find = FindOptions {
            sort: parsed.transforms.sort.clone(),
            skip: parsed.transforms.skip.unwrap_or(0),
            limit: parsed.transforms.limit,
            projection,
        };
        match &parsed.cursor_operation {
            Some(CursorOperation::Count) => {
                let count = self.engine.count(collection, &filter)?;
                Ok((Vec::new(), Some(Value::from(count))))
            }
            Some(CursorOperation::Explain) => {
                let plan = self.engine.explain(collection, &filter, &find)?;
                Ok((Vec::new(), Some(plan)))
            }
            Some(CursorOperation::Map(_)) => Err(EngineError::Unsupported("$map".to_string()).into()),
            None => Ok((self.engine.find_many(collection, &filter, &find)?, None)),
        }
    }

    /// Runs `query` and returns matching live snapshots.
    pub fn query(
        &self,
        collection: &str,
        query: &Value,
        fields: Option<&[String]>,
        options: ReadOptions,
    ) -> Result<QueryResult, DbError> {
        validate_collection_name(collection)?;
        let parsed = self.prepare_query(query)?;
        let (rows, extra) = self.execute(collection, &parsed, snapshot_projection(fields, options.metadata))?;
        let snapshots = rows.into_iter().map(row_to_snapshot).collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult { snapshots, extra })
    }

    /// Runs `query` and returns only matching ids.
    pub fn query_poll(&self, collection: &str, query: &Value) -> Result<PollResult, DbError> {
        validate_collection_name(collection)?;
        let parsed = self.prepare_query(query)?;
        let (rows, extra) = self.execute(collection, &parsed, Projection::Include(Vec::new()))?;
        let ids = rows.iter().map(row_key).collect::<Result<Vec<_>, _>>()?;
        Ok(PollResult { ids, extra })
    }

    /// True if document `id` currently matches `query`.
    pub fn query_poll_doc(&self, collection: &str, id: &str, query: &Value) -> Result<bool, DbError> {
        validate_collection_name(collection)?;
        let mut parsed = self.prepare_query(query)?;
        if !restrict_to_id(&mut parsed.filter, id) {
            return Ok(false);
        }
        let filter = Value::Object(parsed.filter);
        Ok(self
            .engine
            .find_one(collection, &filter, &Projection::Include(Vec::new()))?
            .is_some())
    }

    /// True if `query` can be checked one document at a time.
    pub fn can_poll_doc(&self, _collection: &str, query: &Value) -> bool {
        poll::can_poll_doc(query)
    }

    /// True if `op` on `id` cannot change the result of `query`.
    pub fn skip_poll(&self, _collection: &str, _id: &str, op: &Op, query: &Value) -> bool {
        poll::skip_poll(op, query)
    }
}

/// Narrows `filter` to document `id`. Returns false when the filter's own
/// `_id` condition already rules the document out.
fn restrict_to_id(filter: &mut Map<String, Value>, id: &str) -> bool {
    let id_value = Value::String(id.to_string());
    match filter.remove(ID_FIELD) {
        Some(Value::Object(cond)) => {
            let in_only = match cond.get("$in") {
                Some(Value::Array(ids)) if cond.len() == 1 => Some(ids.iter().any(|v| v.as_str() == Some(id))),
                _ => None,
            };
            match in_only {
                Some(false) => return false,
                Some(true) => {
                    filter.insert(ID_FIELD.to_string(), id_value);
                }
                None => {
                    let mut and = match filter.remove("$and") {
                        Some(Value::Array(items)) => items,
                        Some(other) => vec![other],
                        None => Vec::new(),
                    };
                    and.push(json!({ "_id": id_value }));
                    and.push(json!({ "_id": Value::Object(cond) }));
                    filter.insert("$and".to_string(), Value::Array(and));
                }
            }
        }
        Some(Value::String(other)) if other != id => return false,
        Some(Value::Number(_) | Value::Bool(true) | Value::Array(_)) => return false,
        _ => {
            filter.insert(ID_FIELD.to_string(), id_value);
        }
    }
    true
}
