mod common;

use std::sync::{Arc, atomic::Ordering};

use serde_json::json;

use otstore::{
    config::{ReadOptions, StoreConfig},
    core::store::DocStore,
    engine::memory::MemoryEngine,
    middleware::{MiddlewareAction, MiddlewareError},
    op::{Op, OpComponent},
    snapshot::Snapshot,
};

use common::{FailingEngine, TYPE, commit_chain, commit_with, next_op, read, versions};

fn memory_store() -> (Arc<MemoryEngine>, DocStore) {
    let engine = Arc::new(MemoryEngine::new());
    let store = DocStore::new(engine.clone(), StoreConfig::default());
    (engine, store)
}

#[test]
fn create_is_readable_with_its_op_link() {
    let (_, store) = memory_store();
    let created = Snapshot::new("doc", 1, TYPE, json!({ "x": 1 }));
    assert!(store
        .commit("docs", "doc", &Op::create(0, TYPE, json!({ "x": 1 })), &created)
        .expect("commit"));

    let snapshot = read(&store, "docs", "doc");
    assert_eq!(snapshot.v, 1);
    assert_eq!(snapshot.type_name.as_deref(), Some(TYPE));
    assert_eq!(snapshot.data, Some(json!({ "x": 1 })));
    assert!(snapshot.op_link.is_some());
}

#[test]
fn missing_document_reads_as_version_zero() {
    let (_, store) = memory_store();
    let snapshot = read(&store, "docs", "nope");
    assert_eq!(snapshot, Snapshot::missing("nope"));
}

#[test]
fn second_create_loses_and_leaves_no_op_behind() {
    let (engine, store) = memory_store();
    let created = Snapshot::new("doc", 1, TYPE, json!({ "x": 1 }));
    let create = Op::create(0, TYPE, json!({ "x": 1 }));
    assert!(store.commit("docs", "doc", &create, &created).expect("first"));
    assert!(!store.commit("docs", "doc", &create, &created).expect("second"));
    assert_eq!(engine.len("o_docs").expect("len"), 1);
    assert_eq!(read(&store, "docs", "doc").v, 1);
}

#[test]
fn stale_edit_is_rejected() {
    let (_, store) = memory_store();
    let v1 = commit_chain(&store, "docs", "doc", 1);
    let (op, next) = next_op("doc", &v1);
    commit_with(&store, "docs", "doc", &op, &next);

    assert!(!store.commit("docs", "doc", &op, &next).expect("stale"));
    let ops = store
        .get_ops("docs", "doc", 0, None, ReadOptions::default())
        .expect("ops");
    assert_eq!(versions(&ops), vec![0, 1]);
}

#[test]
fn concurrent_writers_exactly_one_wins() {
    let (engine, store) = memory_store();
    let base = commit_chain(&store, "docs", "doc", 1);

    let wins: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = &store;
                let base = &base;
                scope.spawn(move || {
                    let op = Op::edit(1, vec![OpComponent::new(["n"], json!({ "na": i }))])
                        .with_source(format!("client{i}"), 1);
                    let next = Snapshot::new("doc", 2, TYPE, json!({ "n": i })).with_op_link(base.op_link);
                    store.commit("docs", "doc", &op, &next).expect("commit")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count()
    });

    assert_eq!(wins, 1);
    assert_eq!(engine.len("o_docs").expect("len"), 2);
    let ops = store
        .get_ops("docs", "doc", 0, None, ReadOptions::default())
        .expect("ops");
    assert_eq!(versions(&ops), vec![0, 1]);
}

#[test]
fn delete_racing_an_edit_wins_once() {
    let (_, store) = memory_store();
    let v2 = commit_chain(&store, "docs", "doc", 2);

    let tombstone = Snapshot::tombstone("doc", 3).with_op_link(v2.op_link);
    assert!(store.commit("docs", "doc", &Op::delete(2), &tombstone).expect("delete"));

    let (edit, edited) = next_op("doc", &v2);
    assert!(!store.commit("docs", "doc", &edit, &edited).expect("edit"));

    let snapshot = read(&store, "docs", "doc");
    assert!(snapshot.is_tombstone());
    assert_eq!(snapshot.v, 3);
    assert_eq!(snapshot.data, None);

    let ops = store
        .get_ops("docs", "doc", 0, None, ReadOptions::default())
        .expect("ops");
    assert_eq!(versions(&ops), vec![0, 1, 2]);
    assert!(ops[2].is_delete());
}

#[test]
fn recreate_after_delete_continues_the_chain() {
    let (_, store) = memory_store();
    let v1 = commit_chain(&store, "docs", "doc", 1);
    let tombstone = Snapshot::tombstone("doc", 2).with_op_link(v1.op_link);
    let deleted = commit_with(&store, "docs", "doc", &Op::delete(1), &tombstone);

    let recreated = Snapshot::new("doc", 3, TYPE, json!({ "again": true })).with_op_link(deleted.op_link);
    let snapshot = commit_with(&store, "docs", "doc", &Op::create(2, TYPE, json!({ "again": true })), &recreated);
    assert_eq!(snapshot.v, 3);

    let ops = store
        .get_ops("docs", "doc", 0, None, ReadOptions::default())
        .expect("ops");
    assert_eq!(versions(&ops), vec![0, 1, 2]);
    assert!(ops[2].is_create());
}

#[test]
fn failed_swap_removes_the_appended_op() {
    let engine = Arc::new(FailingEngine::default());
    let store = DocStore::new(engine.clone(), StoreConfig::default());
    let v1 = commit_chain(&store, "docs", "doc", 1);

    engine.fail_swap.store(true, Ordering::SeqCst);
    let (op, next) = next_op("doc", &v1);
    let err = store.commit("docs", "doc", &op, &next).expect_err("swap fails");
    assert_eq!(err.code(), None);
    assert_eq!(engine.inner.len("o_docs").expect("len"), 1);
}

#[test]
fn orphan_left_by_failed_cleanup_is_never_returned() {
    let engine = Arc::new(FailingEngine::default());
    let store = DocStore::new(engine.clone(), StoreConfig::default());
    assert_eq!(commit_chain(&store, "docs", "doc", 1).v, 1);

    engine.fail_delete.store(true, Ordering::SeqCst);
    let stale = Snapshot::new("doc", 1, TYPE, json!({})).with_op_link(None);
    assert!(!store
        .commit("docs", "doc", &Op::create(0, TYPE, json!({})), &stale)
        .expect("losing create"));
    assert_eq!(engine.inner.len("o_docs").expect("len"), 2);

    engine.fail_delete.store(false, Ordering::SeqCst);
    let v2 = commit_chain(&store, "docs", "doc", 1);
    assert_eq!(v2.v, 2);
    let ops = store
        .get_ops("docs", "doc", 0, None, ReadOptions::default())
        .expect("ops");
    assert_eq!(versions(&ops), vec![0, 1]);
    assert_eq!(ops[0].kind, Op::create(0, TYPE, json!({ "n": 0 })).kind);
}

#[test]
fn op_without_version_is_rejected() {
    let (engine, store) = memory_store();
    let mut op = Op::create(0, TYPE, json!({}));
    op.v = None;
    let next = Snapshot::new("doc", 1, TYPE, json!({}));
    let err = store.commit("docs", "doc", &op, &next).expect_err("no version");
    assert_eq!(err.code(), Some(4101));

    let zero = Snapshot::new("doc", 0, TYPE, json!({}));
    let err = store
        .commit("docs", "doc", &Op::create(0, TYPE, json!({})), &zero)
        .expect_err("version zero");
    assert_eq!(err.code(), Some(4101));
    assert!(engine.is_empty("o_docs").expect("empty"));
}

#[test]
fn reserved_collections_are_rejected() {
    let (_, store) = memory_store();
    let next = Snapshot::new("doc", 1, TYPE, json!({}));
    let create = Op::create(0, TYPE, json!({}));
    for collection in ["system", "o_docs"] {
        let err = store.commit(collection, "doc", &create, &next).expect_err("commit");
        assert_eq!(err.code(), Some(4102));
        let err = store
            .get_snapshot(collection, "doc", None, ReadOptions::default())
            .expect_err("snapshot");
        assert_eq!(err.code(), Some(4102));
        let err = store
            .get_ops(collection, "doc", 0, None, ReadOptions::default())
            .expect_err("ops");
        assert_eq!(err.code(), Some(4102));
        let err = store
            .query(collection, &json!({}), None, ReadOptions::default())
            .expect_err("query");
        assert_eq!(err.code(), Some(4102));
    }
}

#[test]
fn metadata_is_only_returned_on_request() {
    let (_, store) = memory_store();
    let created = Snapshot::new("doc", 1, TYPE, json!({ "x": 1 })).with_meta(json!({ "ctime": 5 }));
    let op = Op::create(0, TYPE, json!({ "x": 1 })).with_meta(json!({ "ts": 9 }));
    commit_with(&store, "docs", "doc", &op, &created);

    let plain = read(&store, "docs", "doc");
    assert_eq!(plain.m, None);
    let with_meta = ReadOptions {
        metadata: true,
        ..ReadOptions::default()
    };
    let full = store
        .get_snapshot("docs", "doc", None, with_meta)
        .expect("snapshot");
    assert_eq!(full.m, Some(json!({ "ctime": 5 })));

    let ops = store.get_ops("docs", "doc", 0, None, ReadOptions::default()).expect("ops");
    assert_eq!(ops[0].m, None);
    let ops = store.get_ops("docs", "doc", 0, None, with_meta).expect("ops");
    assert_eq!(ops[0].m, Some(json!({ "ts": 9 })));
}

#[test]
fn non_object_data_survives_storage() {
    let (_, store) = memory_store();
    let created = Snapshot::new("doc", 1, "text", json!("hello"));
    commit_with(&store, "docs", "doc", &Op::create(0, "text", json!("hello")), &created);
    assert_eq!(read(&store, "docs", "doc").data, Some(json!("hello")));
}

#[test]
fn write_middleware_can_rewrite_or_abort() {
    let (engine, mut store) = memory_store();
    store
        .use_middleware(MiddlewareAction::BeforeCreate, |mut req| {
            if let Some(doc) = req.doc.as_mut() {
                doc.insert("stamped".to_string(), json!(true));
            }
            Ok(req)
        })
        .use_middleware(MiddlewareAction::BeforeOverwrite, |_req| {
            Err(MiddlewareError {
                message: "frozen".to_string(),
                code: Some(4900),
            })
        });

    let v1 = commit_chain(&store, "docs", "doc", 1);
    assert_eq!(v1.data, Some(json!({ "n": 0, "stamped": true })));

    let (op, next) = next_op("doc", &v1);
    let err = store.commit("docs", "doc", &op, &next).expect_err("aborted");
    assert_eq!(err.code(), Some(4900));
    assert_eq!(engine.len("o_docs").expect("len"), 1);
    assert_eq!(read(&store, "docs", "doc").v, 1);
}
