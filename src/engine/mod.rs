//! Storage-engine contract and the bundled engines.
//!
//! An engine stores JSON rows grouped into named collections. Every row has a
//! string `_id` that is unique within its collection. Filters use the
//! operator language evaluated by [`filter`].

/// Filter evaluation, sorting and projection over JSON rows.
pub mod filter;
/// Mutex-guarded in-process engine.
pub mod memory;
/// SQLite-backed engine.
pub mod sqlite;

use serde_json::{Value, json};

use crate::types::{Row, Version};

/// Engine failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A row with the same `_id` already exists.
    #[error("duplicate key {key} in {collection}")]
    UniquenessConflict {
        /// Collection written to.
        collection: String,
        /// Conflicting `_id`.
        key: String,
    },
    /// SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Row encoding failure.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// The engine does not implement the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The filter or row is not well formed.
    #[error("malformed: {0}")]
    Malformed(String),
    /// A previous panic poisoned the engine lock.
    #[error("engine lock poisoned")]
    Poisoned,
}

/// Engine result alias.
pub type EngineResult<T> = Result<T, EngineError>;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Field selection applied to returned rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    /// Return whole rows.
    #[default]
    All,
    /// Return `_id` plus the listed top-level fields.
    Include(Vec<String>),
    /// Return everything but the listed top-level fields.
    Exclude(Vec<String>),
}

/// Range-read options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort keys, most significant first.
    pub sort: Vec<(String, SortOrder)>,
    /// Rows to skip after sorting.
    pub skip: u64,
    /// Maximum rows to return.
    pub limit: Option<u64>,
    /// Fields to return.
    pub projection: Projection,
}

impl FindOptions {
    /// Options sorting ascending by `field`.
    pub fn sorted_by(field: &str) -> Self {
        Self {
            sort: vec![(field.to_string(), SortOrder::Ascending)],
            ..Self::default()
        }
    }

    /// Sets the row limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the projection.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }
}

/// Primitives the document store needs from a backing database.
///
/// Implementations must make `insert`, `compare_and_swap` and `delete`
/// individually atomic; the store relies on nothing else for consistency.
pub trait StorageEngine: Send + Sync {
    /// Short engine name used in explain output.
    fn name(&self) -> &'static str;

    /// Rows matching `filter`, sorted, paged and projected.
    fn find_many(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Vec<Row>>;

    /// First row matching `filter`.
    fn find_one(&self, collection: &str, filter: &Value, projection: &Projection) -> EngineResult<Option<Row>> {
        let options = FindOptions::default()
            .with_limit(1)
            .with_projection(projection.clone());
        Ok(self.find_many(collection, filter, &options)?.into_iter().next())
    }

    /// Inserts a row; fails with [`EngineError::UniquenessConflict`] when the
    /// `_id` is taken.
    fn insert(&self, collection: &str, row: Row) -> EngineResult<()>;

    /// Replaces the row with `_id == key` if its `_v` equals
    /// `expected_version`. Returns the number of rows replaced.
    fn compare_and_swap(&self, collection: &str, key: &str, expected_version: Version, row: Row) -> EngineResult<u64>;

    /// Deletes the row with `_id == key`. Returns the number of rows removed.
    fn delete(&self, collection: &str, key: &str) -> EngineResult<u64>;

    /// Number of rows matching `filter`.
    fn count(&self, collection: &str, filter: &Value) -> EngineResult<u64> {
        Ok(self.find_many(collection, filter, &FindOptions::default())?.len() as u64)
    }

    /// Distinct values of `field` among rows matching `filter`.
    fn distinct(&self, collection: &str, field: &str, filter: &Value) -> EngineResult<Vec<Value>> {
        let rows = self.find_many(collection, filter, &FindOptions::default())?;
        Ok(filter::distinct_values(&rows, field))
    }

    /// Describes how a read would be executed.
    fn explain(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Value> {
        let matched = self.find_many(collection, filter, options)?.len();
        Ok(json!({
            "engine": self.name(),
            "collection": collection,
            "filter": filter,
            "matched": matched,
        }))
    }

    /// Runs an aggregation pipeline.
    fn aggregate(&self, _collection: &str, _pipeline: &Value) -> EngineResult<Value> {
        Err(EngineError::Unsupported(format!("{} engine has no $aggregate", self.name())))
    }

    /// Runs a map-reduce job.
    fn map_reduce(&self, _collection: &str, _spec: &Value, _filter: &Value) -> EngineResult<Value> {
        Err(EngineError::Unsupported(format!("{} engine has no $mapReduce", self.name())))
    }
}

/// Reads the string `_id` of a row.
pub fn row_key(row: &Row) -> EngineResult<String> {
    match row.get("_id") {
        Some(Value::String(key)) => Ok(key.clone()),
        _ => Err(EngineError::Malformed("row `_id` must be a string".to_string())),
    }
}

/// Reads the `_v` of a row, if it is a non-negative integer.
pub fn row_version(row: &Row) -> Option<Version> {
    row.get("_v").and_then(Value::as_u64)
}
