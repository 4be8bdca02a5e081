//! Append-then-swap commit of one op and its resulting snapshot.
//!
//! The op row is written first with a link to the snapshot's previous op.
//! The snapshot is then inserted (first version) or swapped in against the
//! expected prior version. A lost race leaves the op row unreferenced, so it
//! is deleted on a best-effort basis; readers tolerate any that survive.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    engine::EngineError,
    middleware::{MiddlewareAction, MiddlewareRequest},
    op::{Op, OpRecord},
    snapshot::Snapshot,
    types::{OpId, ops_collection},
};

use super::{
    cast::snapshot_to_row,
    store::{DbError, DocStore, validate_collection_name},
};

impl DocStore {
    /// Commits `op`, producing `snapshot`. `snapshot.op_link` must be the op
    /// link of the snapshot the op was applied to.
    ///
    /// Returns `Ok(false)` when another writer already moved the document
    /// past `snapshot.v - 1`.
    pub fn commit(&self, collection: &str, id: &str, op: &Op, snapshot: &Snapshot) -> Result<bool, DbError> {
        validate_collection_name(collection)?;
        let Some(v) = op.v else {
            return Err(DbError::InvalidOpVersion);
        };
        if snapshot.v == 0 {
            return Err(DbError::InvalidOpVersion);
        }

        let record = OpRecord {
            id: Uuid::new_v4(),
            doc_id: id.to_string(),
            v,
            op_link: snapshot.op_link,
            op: op.clone(),
        };
        let ops = ops_collection(collection);
        let row = record.to_row().map_err(EngineError::from)?;
        self.engine.insert(&ops, row)?;

        let outcome = self.write_snapshot(collection, id, op, snapshot, record.id);
        let succeeded = matches!(outcome, Ok(true));
        if !succeeded {
            self.discard_op(&ops, record.id);
        }
        debug!(collection, id, version = snapshot.v, succeeded, "commit");
        outcome
    }

    fn write_snapshot(
        &self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
        op_id: OpId,
    ) -> Result<bool, DbError> {
        let row = snapshot_to_row(snapshot, Some(op_id));
        if snapshot.v == 1 {
            let request = MiddlewareRequest::write(MiddlewareAction::BeforeCreate, collection, row, op);
            let row = self.middleware.run(request)?.doc.unwrap_or_default();
            return match self.engine.insert(collection, row) {
                Ok(()) => Ok(true),
                Err(EngineError::UniquenessConflict { .. }) => Ok(false),
                Err(err) => Err(err.into()),
            };
        }

        let request = MiddlewareRequest::write(MiddlewareAction::BeforeOverwrite, collection, row, op);
        let row = self.middleware.run(request)?.doc.unwrap_or_default();
        let matched = self.engine.compare_and_swap(collection, id, snapshot.v - 1, row)?;
        Ok(matched == 1)
    }

    fn discard_op(&self, ops: &str, op_id: OpId) {
        let key = op_id.to_string();
        if let Err(err) = self.engine.delete(ops, &key) {
            warn!(collection = ops, op = %key, error = %err, "failed to remove uncommitted op");
        }
    }
}
