mod common;

use serde_json::{Value, json};

use otstore::{
    config::{ReadOptions, StoreConfig},
    core::store::DocStore,
    middleware::{MiddlewareAction, MiddlewareError},
    op::Op,
    snapshot::Snapshot,
};

use common::{TYPE, commit_with, read};

fn create(store: &DocStore, id: &str, data: Value) -> Snapshot {
    let next = Snapshot::new(id, 1, TYPE, data.clone());
    commit_with(store, "docs", id, &Op::create(0, TYPE, data), &next)
}

fn delete(store: &DocStore, id: &str) {
    let current = read(store, "docs", id);
    let tombstone = Snapshot::tombstone(id, current.v + 1).with_op_link(current.op_link);
    commit_with(store, "docs", id, &Op::delete(current.v), &tombstone);
}

fn seeded(config: StoreConfig) -> DocStore {
    let store = DocStore::in_memory(config);
    create(&store, "test1", json!({ "x": 1, "y": 1 }));
    create(&store, "test2", json!({ "x": 2, "y": 2 }));
    create(&store, "test3", json!({ "x": 3, "y": 2 }));
    store
}

fn run(store: &DocStore, query: Value) -> (Vec<String>, Option<Value>) {
    let result = store
        .query("docs", &query, None, ReadOptions::default())
        .expect("query");
    (result.snapshots.into_iter().map(|s| s.id).collect(), result.extra)
}

fn error_code(store: &DocStore, query: Value) -> Option<u16> {
    store
        .query("docs", &query, None, ReadOptions::default())
        .expect_err("rejected")
        .code()
}

#[test]
fn commit_and_query_round_trip() {
    let store = DocStore::in_memory(StoreConfig::default());
    let created = create(&store, "test", json!({}));
    let result = store
        .query("docs", &json!({}), None, ReadOptions::default())
        .expect("query");
    assert_eq!(result.snapshots, vec![created]);
    assert_eq!(result.extra, None);
}

#[test]
fn deleted_documents_are_not_returned() {
    let store = seeded(StoreConfig::default());
    delete(&store, "test2");

    let (ids, _) = run(&store, json!({}));
    assert_eq!(ids, vec!["test1", "test3"]);
    let (ids, _) = run(&store, json!({ "_id": "test2" }));
    assert!(ids.is_empty());
    let (ids, _) = run(&store, json!({ "x": { "$ne": 1 } }));
    assert_eq!(ids, vec!["test3"]);
}

#[test]
fn count_reports_in_extra() {
    let store = seeded(StoreConfig::default());
    delete(&store, "test1");
    let (ids, extra) = run(&store, json!({ "$count": true }));
    assert!(ids.is_empty());
    assert_eq!(extra, Some(json!(2)));

    let (_, extra) = run(&store, json!({ "y": 2, "$count": true }));
    assert_eq!(extra, Some(json!(2)));
}

#[test]
fn distinct_reports_in_extra() {
    let store = seeded(StoreConfig::default());
    let (ids, extra) = run(&store, json!({ "$distinct": { "field": "y" } }));
    assert!(ids.is_empty());
    assert_eq!(extra, Some(json!([1, 2])));
}

#[test]
fn explain_reports_in_extra() {
    let store = seeded(StoreConfig::default());
    let (ids, extra) = run(&store, json!({ "$explain": true }));
    assert!(ids.is_empty());
    let plan = extra.expect("plan");
    assert_eq!(plan["engine"], json!("memory"));
    assert_eq!(plan["matched"], json!(3));
}

#[test]
fn sort_skip_and_limit_page_results() {
    let store = DocStore::in_memory(StoreConfig::default());
    for (id, x) in [("c", 3), ("a", 1), ("e", 5), ("b", 2), ("d", 4)] {
        create(&store, id, json!({ "x": x }));
    }

    let (ids, _) = run(&store, json!({ "$sort": { "x": 1 }, "$skip": 1, "$limit": 2 }));
    assert_eq!(ids, vec!["b", "c"]);
    let (ids, _) = run(&store, json!({ "$sort": [["x", -1]], "$limit": 2 }));
    assert_eq!(ids, vec!["e", "d"]);
    let (ids, _) = run(&store, json!({ "$sort": { "x": 1 }, "$limit": 0 }));
    assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    let (ids, _) = run(&store, json!({ "x": { "$gte": 4 }, "$sort": { "x": -1 }, "$comment": "paged" }));
    assert_eq!(ids, vec!["e", "d"]);
}

#[test]
fn disabled_query_forms_are_rejected() {
    let store = seeded(StoreConfig::default());
    assert_eq!(error_code(&store, json!({ "$where": "this.x == 1" })), Some(4103));
    assert_eq!(
        error_code(&store, json!({ "$and": [{ "$where": "this.x == 1" }] })),
        Some(4103)
    );
    assert_eq!(
        error_code(&store, json!({ "$mapReduce": { "map": "f", "reduce": "g" } })),
        Some(4104)
    );
    assert_eq!(
        error_code(&store, json!({ "$aggregate": [{ "$group": { "_id": "$y" } }] })),
        Some(4105)
    );
}

#[test]
fn enabled_query_forms_reach_the_engine() {
    let config = StoreConfig::from_json_str(r#"{ "allow_js_queries": true, "allow_aggregate_queries": true }"#)
        .expect("config");
    assert_eq!(config.lenient_window, StoreConfig::default().lenient_window);
    let store = seeded(config);

    // The memory engine implements neither, so the failure comes from the engine.
    assert_eq!(
        error_code(&store, json!({ "$aggregate": [{ "$group": { "_id": "$y" } }] })),
        None
    );
    assert_eq!(
        error_code(&store, json!({ "$mapReduce": { "map": "f", "reduce": "g" } })),
        None
    );
    assert_eq!(error_code(&store, json!({ "$mapReduce": true })), Some(4107));
}

#[test]
fn malformed_queries_are_rejected() {
    let store = seeded(StoreConfig::default());
    assert_eq!(error_code(&store, json!({ "$query": {} })), Some(4106));
    assert_eq!(error_code(&store, json!({ "$readPref": true })), Some(4107));
    assert_eq!(error_code(&store, json!({ "$skip": -1 })), Some(4107));
    assert_eq!(error_code(&store, json!({ "$limit": "ten" })), Some(4107));
    assert_eq!(error_code(&store, json!({ "$sort": 1 })), Some(4107));
    assert_eq!(error_code(&store, json!({ "$distinct": { "y": 1 } })), Some(4107));
    assert_eq!(
        error_code(&store, json!({ "$distinct": { "y": 1 }, "$aggregate": {} })),
        Some(4108)
    );
    assert_eq!(error_code(&store, json!({ "$count": true, "$explain": true })), Some(4109));
    assert_eq!(
        error_code(&store, json!({ "$distinct": { "y": 1 }, "$sort": { "y": 1 } })),
        Some(4110)
    );
    assert_eq!(
        error_code(&store, json!({ "$distinct": { "y": 1 }, "$count": true })),
        Some(4110)
    );
}

#[test]
fn projection_and_metadata() {
    let store = DocStore::in_memory(StoreConfig::default());
    let next = Snapshot::new("doc", 1, TYPE, json!({ "x": 1, "y": 2 })).with_meta(json!({ "mtime": 3 }));
    commit_with(&store, "docs", "doc", &Op::create(0, TYPE, json!({})), &next);

    let fields = vec!["x".to_string()];
    let result = store
        .query("docs", &json!({}), Some(&fields), ReadOptions::default())
        .expect("query");
    let snapshot = &result.snapshots[0];
    assert_eq!(snapshot.v, 1);
    assert_eq!(snapshot.type_name.as_deref(), Some(TYPE));
    assert_eq!(snapshot.data, Some(json!({ "x": 1 })));
    assert_eq!(snapshot.m, None);
    assert!(snapshot.op_link.is_some());

    let with_meta = ReadOptions {
        metadata: true,
        ..ReadOptions::default()
    };
    let result = store
        .query("docs", &json!({ "_m.mtime": 3 }), Some(&fields), with_meta)
        .expect("query");
    assert_eq!(result.snapshots[0].m, Some(json!({ "mtime": 3 })));

    let snapshot = store
        .get_snapshot("docs", "doc", Some(&fields), ReadOptions::default())
        .expect("snapshot");
    assert_eq!(snapshot.data, Some(json!({ "x": 1 })));
}

#[test]
fn bulk_snapshots_fill_in_missing_ids() {
    let store = seeded(StoreConfig::default());
    let ids = vec!["test1".to_string(), "nope".to_string()];
    let snapshots = store
        .get_snapshot_bulk("docs", &ids, None, ReadOptions::default())
        .expect("bulk");
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots["test1"].data, Some(json!({ "x": 1, "y": 1 })));
    assert_eq!(snapshots["nope"], Snapshot::missing("nope"));
}

#[test]
fn query_poll_returns_ids_only() {
    let store = seeded(StoreConfig::default());
    let result = store
        .query_poll("docs", &json!({ "y": 2, "$sort": { "x": -1 } }))
        .expect("poll");
    assert_eq!(result.ids, vec!["test3", "test2"]);
    assert_eq!(result.extra, None);

    let result = store.query_poll("docs", &json!({ "$count": true })).expect("poll");
    assert!(result.ids.is_empty());
    assert_eq!(result.extra, Some(json!(3)));
}

#[test]
fn query_poll_doc_filters_on_id() {
    let store = DocStore::in_memory(StoreConfig::default());
    create(&store, "test", json!({ "x": 5 }));
    create(&store, "other", json!({ "x": 5 }));

    let cases = [
        (json!({ "_id": "test" }), true),
        (json!({ "_id": "nottest" }), false),
        (json!({ "_id": { "$in": ["test"] } }), true),
        (json!({ "_id": { "$in": ["nottest"] } }), false),
        (json!({ "_id": { "$ne": "nottest" } }), true),
        (json!({ "_id": { "$ne": "test" } }), false),
        (json!({ "_id": { "$in": ["test"] }, "$and": [{ "x": 5 }] }), true),
        (json!({ "_id": 7 }), false),
        (json!({ "x": 5 }), true),
        (json!({ "x": 6 }), false),
    ];
    for (query, expected) in cases {
        let got = store.query_poll_doc("docs", "test", &query).expect("poll doc");
        assert_eq!(got, expected, "{query}");
    }

    let err = store
        .query_poll_doc("docs", "test", &json!({ "$where": "true" }))
        .expect_err("where");
    assert_eq!(err.code(), Some(4103));
}

#[test]
fn query_poll_doc_skips_tombstones() {
    let store = DocStore::in_memory(StoreConfig::default());
    create(&store, "test", json!({ "x": 5 }));
    delete(&store, "test");
    assert!(!store.query_poll_doc("docs", "test", &json!({})).expect("poll doc"));
}

#[test]
fn lookup_middleware_scopes_snapshot_reads() {
    let mut store = DocStore::in_memory(StoreConfig::default());
    store.use_middleware(MiddlewareAction::BeforeSnapshotLookup, |mut req| {
        req.filter.insert("owner".to_string(), json!("alice"));
        Ok(req)
    });
    create(&store, "mine", json!({ "owner": "alice" }));
    let theirs = Snapshot::new("theirs", 1, TYPE, json!({ "owner": "bob" }));
    assert!(store
        .commit("docs", "theirs", &Op::create(0, TYPE, json!({})), &theirs)
        .expect("commit"));

    assert_eq!(read(&store, "docs", "theirs"), Snapshot::missing("theirs"));
    let ids = vec!["mine".to_string(), "theirs".to_string()];
    let snapshots = store
        .get_snapshot_bulk("docs", &ids, None, ReadOptions::default())
        .expect("bulk");
    assert_eq!(snapshots["mine"].v, 1);
    assert_eq!(snapshots["theirs"].v, 0);
}

#[test]
fn lookup_middleware_can_abort() {
    let mut store = DocStore::in_memory(StoreConfig::default());
    store.use_middleware(MiddlewareAction::BeforeSnapshotLookup, |_req| {
        Err(MiddlewareError::new("no reads"))
    });
    let err = store
        .get_snapshot("docs", "doc", None, ReadOptions::default())
        .expect_err("aborted");
    assert_eq!(err.code(), None);
    assert_eq!(err.to_string(), "middleware rejected request: no reads");
}
