//! Runtime event stream payloads.

use crate::{op::Op, types::{DocId, Version}};

/// Events broadcast by a [`crate::runtime::handle::StoreHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// An op was committed and its snapshot written.
    Committed {
        /// Snapshot collection.
        collection: String,
        /// Document id.
        id: DocId,
        /// Version of the new snapshot.
        version: Version,
        /// The committed op.
        op: Op,
    },
}
