#![allow(dead_code)]

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use hashbrown::HashMap;
use serde_json::{Value, json};
use uuid::Uuid;

use otstore::{
    config::ReadOptions,
    core::store::DocStore,
    engine::{
        EngineError, EngineResult, FindOptions, StorageEngine, memory::MemoryEngine, row_key,
    },
    op::{Op, OpComponent, OpRecord},
    snapshot::Snapshot,
    types::{OpId, Row, Version, ops_collection},
};

pub const TYPE: &str = "json0";

/// Next op for `current` and the snapshot it produces.
pub fn next_op(id: &str, current: &Snapshot) -> (Op, Snapshot) {
    let v = current.v;
    let op = if v == 0 {
        Op::create(0, TYPE, json!({ "n": 0 }))
    } else {
        Op::edit(v, vec![OpComponent::new(["n"], json!({ "na": 1 }))])
    };
    let next = Snapshot::new(id, v + 1, TYPE, json!({ "n": v })).with_op_link(current.op_link);
    (op, next)
}

pub fn read(store: &DocStore, collection: &str, id: &str) -> Snapshot {
    store
        .get_snapshot(collection, id, None, ReadOptions::default())
        .expect("snapshot")
}

/// Commits `op` producing `next`, which must succeed, and returns the stored snapshot.
pub fn commit_with(store: &DocStore, collection: &str, id: &str, op: &Op, next: &Snapshot) -> Snapshot {
    assert!(store.commit(collection, id, op, next).expect("commit"), "commit lost");
    read(store, collection, id)
}

/// Commits `n` more ops to `id`, starting with a create if the doc is new.
pub fn commit_chain(store: &DocStore, collection: &str, id: &str, n: u64) -> Snapshot {
    let mut current = read(store, collection, id);
    for _ in 0..n {
        let (op, next) = next_op(id, &current);
        current = commit_with(store, collection, id, &op, &next);
    }
    current
}

pub fn versions(ops: &[Op]) -> Vec<Version> {
    ops.iter().filter_map(|op| op.v).collect()
}

/// Writes an op row that no snapshot links to, as a lost commit race would.
pub fn insert_orphan(engine: &dyn StorageEngine, collection: &str, id: &str, op: Op) -> OpId {
    let record = OpRecord {
        id: Uuid::new_v4(),
        doc_id: id.to_string(),
        v: op.v.expect("orphan needs a version"),
        op_link: Some(Uuid::new_v4()),
        op,
    };
    let row = record.to_row().expect("encode");
    engine.insert(&ops_collection(collection), row).expect("insert orphan");
    record.id
}

/// Ids of the op rows stored for `id` at version `v`.
pub fn op_ids_at(engine: &dyn StorageEngine, collection: &str, id: &str, v: Version) -> Vec<String> {
    engine
        .find_many(
            &ops_collection(collection),
            &json!({ "d": id, "v": v }),
            &FindOptions::default(),
        )
        .expect("find ops")
        .iter()
        .map(|row| row_key(row).expect("key"))
        .collect()
}

/// Memory engine that counts range reads per collection.
#[derive(Debug, Default)]
pub struct CountingEngine {
    pub inner: MemoryEngine,
    reads: Mutex<HashMap<String, usize>>,
}

impl CountingEngine {
    pub fn reads(&self, collection: &str) -> usize {
        self.reads.lock().expect("lock").get(collection).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.reads.lock().expect("lock").clear();
    }
}

impl StorageEngine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn find_many(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Vec<Row>> {
        *self
            .reads
            .lock()
            .expect("lock")
            .entry(collection.to_string())
            .or_default() += 1;
        self.inner.find_many(collection, filter, options)
    }

    fn insert(&self, collection: &str, row: Row) -> EngineResult<()> {
        self.inner.insert(collection, row)
    }

    fn compare_and_swap(&self, collection: &str, key: &str, expected_version: Version, row: Row) -> EngineResult<u64> {
        self.inner.compare_and_swap(collection, key, expected_version, row)
    }

    fn delete(&self, collection: &str, key: &str) -> EngineResult<u64> {
        self.inner.delete(collection, key)
    }
}

/// Memory engine whose swaps or deletes can be made to fail.
#[derive(Debug, Default)]
pub struct FailingEngine {
    pub inner: MemoryEngine,
    pub fail_swap: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl StorageEngine for FailingEngine {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn find_many(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Vec<Row>> {
        self.inner.find_many(collection, filter, options)
    }

    fn insert(&self, collection: &str, row: Row) -> EngineResult<()> {
        self.inner.insert(collection, row)
    }

    fn compare_and_swap(&self, collection: &str, key: &str, expected_version: Version, row: Row) -> EngineResult<u64> {
        if self.fail_swap.load(Ordering::SeqCst) {
            return Err(EngineError::Malformed("injected swap failure".to_string()));
        }
        self.inner.compare_and_swap(collection, key, expected_version, row)
    }

    fn delete(&self, collection: &str, key: &str) -> EngineResult<u64> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(EngineError::Malformed("injected delete failure".to_string()));
        }
        self.inner.delete(collection, key)
    }
}
