//! Versioned JSON document store with an append-only op log.
//!
//! Each collection keeps one snapshot row per document and an op log in
//! `o_<collection>`. Commits append the op, then insert or compare-and-swap
//! the snapshot; ops are read back by following op links from a trusted
//! anchor, so ops orphaned by lost races are never returned.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::DocStore`]:
//! ```
//! use otstore::{
//!     config::{ReadOptions, StoreConfig},
//!     core::store::DocStore,
//!     op::Op,
//!     snapshot::Snapshot,
//! };
//! use serde_json::json;
//!
//! let store = DocStore::in_memory(StoreConfig::default());
//! let created = Snapshot::new("doc1", 1, "json0", json!({ "x": 1 }));
//! assert!(store.commit("things", "doc1", &Op::create(0, "json0", json!({ "x": 1 })), &created).expect("commit"));
//!
//! let current = store.get_snapshot("things", "doc1", None, ReadOptions::default()).expect("snapshot");
//! assert_eq!(current.v, 1);
//! let deleted = Snapshot::tombstone("doc1", 2).with_op_link(current.op_link);
//! assert!(store.commit("things", "doc1", &Op::delete(1), &deleted).expect("commit"));
//!
//! let ops = store.get_ops("things", "doc1", 0, None, ReadOptions::default()).expect("ops");
//! assert_eq!(ops.len(), 2);
//! ```
//!
//! Async usage over SQLite:
//! ```no_run
//! use std::sync::Arc;
//!
//! use otstore::{
//!     config::StoreConfig,
//!     core::store::DocStore,
//!     engine::sqlite::SqliteEngine,
//!     op::Op,
//!     runtime::handle::connect,
//!     snapshot::Snapshot,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let handle = connect(|| {
//!     let engine = SqliteEngine::open("otstore.db")?;
//!     Ok(DocStore::new(Arc::new(engine), StoreConfig::default()))
//! });
//! let snapshot = Snapshot::new("doc1", 1, "json0", json!({}));
//! handle
//!     .commit("things", "doc1", Op::create(0, "json0", json!({})), snapshot)
//!     .await
//!     .expect("commit");
//! handle.close().expect("close");
//! # }
//! ```
#![deny(missing_docs)]

/// Store configuration and per-call read options.
pub mod config;
/// Document store, commit path and op-chain reconstruction.
pub mod core;
/// Storage engine trait with in-memory and SQLite backends.
pub mod engine;
/// Hooks run before snapshot writes and lookups.
pub mod middleware;
/// Operation model and stored op records.
pub mod op;
/// Query parsing, policy checks and poll analysis.
pub mod query;
/// Async handle and event stream.
pub mod runtime;
/// Document snapshots.
pub mod snapshot;
/// Shared primitive types and field names.
pub mod types;
