//! In-process storage engine.

use std::sync::{Mutex, MutexGuard};

use hashbrown::HashMap;
use serde_json::Value;

use super::{
    EngineError, EngineResult, FindOptions, StorageEngine, filter, row_key, row_version,
};
use crate::types::{Row, Version};

#[derive(Debug, Default)]
struct Collection {
    rows: HashMap<String, Row>,
    order: Vec<String>,
}

/// Storage engine keeping every collection in memory behind one lock.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, HashMap<String, Collection>>> {
        self.collections.lock().map_err(|_| EngineError::Poisoned)
    }

    /// Number of rows currently stored in `collection`.
    pub fn len(&self, collection: &str) -> EngineResult<usize> {
        Ok(self.lock()?.get(collection).map(|c| c.rows.len()).unwrap_or(0))
    }

    /// True when `collection` holds no rows.
    pub fn is_empty(&self, collection: &str) -> EngineResult<bool> {
        Ok(self.len(collection)? == 0)
    }
}

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn find_many(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Vec<Row>> {
        let guard = self.lock()?;
        let Some(coll) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let rows = coll.order.iter().filter_map(|key| coll.rows.get(key).cloned());
        filter::select_rows(rows, filter, options)
    }

    fn insert(&self, collection: &str, row: Row) -> EngineResult<()> {
        let key = row_key(&row)?;
        let mut guard = self.lock()?;
        let coll = guard.entry(collection.to_string()).or_default();
        if coll.rows.contains_key(&key) {
            return Err(EngineError::UniquenessConflict {
                collection: collection.to_string(),
                key,
            });
        }
        coll.order.push(key.clone());
        coll.rows.insert(key, row);
        Ok(())
    }

    fn compare_and_swap(&self, collection: &str, key: &str, expected_version: Version, row: Row) -> EngineResult<u64> {
        let mut guard = self.lock()?;
        let Some(current) = guard.get_mut(collection).and_then(|c| c.rows.get_mut(key)) else {
            return Ok(0);
        };
        if row_version(current) != Some(expected_version) {
            return Ok(0);
        }
        *current = row;
        current.insert("_id".to_string(), Value::String(key.to_string()));
        Ok(1)
    }

    fn delete(&self, collection: &str, key: &str) -> EngineResult<u64> {
        let mut guard = self.lock()?;
        let Some(coll) = guard.get_mut(collection) else {
            return Ok(0);
        };
        if coll.rows.remove(key).is_none() {
            return Ok(0);
        }
        coll.order.retain(|k| k != key);
        Ok(1)
    }
}
