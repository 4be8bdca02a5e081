//! The document store: commits, snapshot reads, op-range reconstruction and
//! queries.

/// Snapshot and op row conversion.
pub mod cast;
/// Op-range reconstruction.
pub mod chain;
/// Commit coordination.
pub mod commit;
/// Unique-version detection over op streams.
pub mod link_validator;
/// Store facade, errors and queries.
pub mod store;
