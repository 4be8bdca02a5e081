//! Reconstruction of contiguous op ranges from the op log.
//!
//! The log may hold orphan ops left by lost commit races, so ops are never
//! trusted by version alone. A range is rebuilt by walking `o` links backward
//! from a trusted op: the snapshot's `_o`, or in lenient mode the first op at
//! or after `to` whose version is unique in the log.

use hashbrown::HashMap;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    config::ReadOptions,
    engine::{FindOptions, SortOrder},
    op::{DOC_FIELD, Op, OpKind, OpRecord, VERSION_FIELD},
    snapshot::Snapshot,
    types::{DocId, OpId, Version, ops_collection},
};

use super::{
    cast::op_projection,
    link_validator::{OpLinkValidator, Versioned},
    store::{DbError, DocStore, SnapshotLink, validate_collection_name},
};

/// Walks back from `link`, keeping ops with `v < to`, in ascending order.
/// `ops` must be sorted ascending by version; ops off the chain are skipped.
pub fn get_linked_ops(ops: &[OpRecord], to: Option<Version>, link: Option<OpId>) -> Vec<OpRecord> {
    let mut link = link;
    let mut linked = Vec::new();
    for op in ops.iter().rev() {
        let Some(want) = link else { break };
        if op.id != want {
            continue;
        }
        link = op.op_link;
        if to.is_none_or(|to| op.v < to) {
            linked.push(op.clone());
        }
    }
    linked.reverse();
    linked
}

/// Selects the ops on the chain ending at the snapshot's op link.
///
/// Without a snapshot row the document is treated as deleted and the walk
/// starts at the latest delete op; an in-flight create yields nothing. A
/// live snapshot without an op link is an error even when no ops were read.
pub fn filter_ops(
    collection: &str,
    id: &str,
    ops: &[OpRecord],
    snapshot: Option<&SnapshotLink>,
    to: Option<Version>,
) -> Result<Vec<OpRecord>, DbError> {
    match snapshot {
        Some(link) => match link.op_link {
            Some(op_link) => Ok(get_linked_ops(ops, to, Some(op_link))),
            None => Err(DbError::MissingOpLink {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        },
        None => {
            let last_delete = ops.iter().rev().find(|op| matches!(op.op.kind, OpKind::Delete));
            Ok(last_delete
                .map(|del| get_linked_ops(ops, to, Some(del.id)))
                .unwrap_or_default())
        }
    }
}

/// Fails unless `ops` starts at `from`. An empty range is accepted only when
/// `empty_ok` is set.
pub fn check_ops_from(
    collection: &str,
    id: &str,
    ops: &[OpRecord],
    from: Version,
    empty_ok: bool,
) -> Result<(), DbError> {
    let contiguous = match ops.first() {
        Some(first) => first.v == from,
        None => empty_ok,
    };
    if contiguous {
        return Ok(());
    }
    Err(DbError::MissingOps {
        collection: collection.to_string(),
        id: id.to_string(),
        from,
    })
}

fn into_ops(records: Vec<OpRecord>) -> Vec<Op> {
    records
        .into_iter()
        .map(|record| {
            let mut op = record.op;
            op.v = Some(record.v);
            op
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    v: Version,
}

impl Versioned for Candidate {
    fn version(&self) -> Option<Version> {
        Some(self.v)
    }
}

impl DocStore {
    fn read_ops(&self, collection: &str, filter: &Value, options: ReadOptions) -> Result<Vec<OpRecord>, DbError> {
        let find = FindOptions::sorted_by(VERSION_FIELD).with_projection(op_projection(options.metadata));
        self.engine
            .find_many(&ops_collection(collection), filter, &find)?
            .into_iter()
            .map(|row| OpRecord::from_row(row).map_err(DbError::from))
            .collect()
    }

    fn read_ops_from(&self, collection: &str, id: &str, from: Version, options: ReadOptions) -> Result<Vec<OpRecord>, DbError> {
        let filter = json!({ DOC_FIELD: id, VERSION_FIELD: { "$gte": from } });
        self.read_ops(collection, &filter, options)
    }

    /// Ops of `id` with `from <= v < to` (or to the end when `to` is `None`).
    pub fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        to: Option<Version>,
        options: ReadOptions,
    ) -> Result<Vec<Op>, DbError> {
        validate_collection_name(collection)?;
        if to.is_some_and(|to| to <= from) {
            return Ok(Vec::new());
        }
        match to {
            Some(to) if self.config.get_ops_without_strict_linking => self.get_ops_lenient(collection, id, from, to, options),
            _ => self.get_ops_strict(collection, id, from, to, options),
        }
    }

    fn get_ops_strict(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        to: Option<Version>,
        options: ReadOptions,
    ) -> Result<Vec<Op>, DbError> {
        let snapshot = self.snapshot_link(collection, id)?;
        if snapshot.is_some_and(|link| link.v <= from) {
            return Ok(Vec::new());
        }
        let records = self.read_ops_from(collection, id, from, options)?;
        let chain = filter_ops(collection, id, &records, snapshot.as_ref(), to)?;
        if !options.ignore_missing_ops {
            check_ops_from(collection, id, &chain, from, snapshot.is_none())?;
        }
        Ok(into_ops(chain))
    }

    /// Reads forward from `from` until a uniquely versioned op at or past
    /// `to` is seen, then walks back from it. Version windows after the
    /// first cover `lenient_window` versions each.
    fn get_ops_lenient(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        to: Version,
        options: ReadOptions,
    ) -> Result<Vec<Op>, DbError> {
        let window = self.config.lenient_window.max(1) as Version;
        let mut validator = OpLinkValidator::new();
        let mut records: Vec<OpRecord> = Vec::new();
        let mut anchor = None;
        let (mut lo, mut hi) = (from, to);

        'read: loop {
            let filter = json!({ DOC_FIELD: id, VERSION_FIELD: { "$gte": lo, "$lte": hi } });
            let page = self.read_ops(collection, &filter, options)?;
            let fetched = page.len();
            for record in page {
                let v = record.v;
                records.push(record);
                if v >= to {
                    validator.push(Some(Candidate {
                        index: records.len() - 1,
                        v,
                    }));
                    if let Some(found) = validator.op_with_unique_version() {
                        anchor = Some(found.index);
                        break 'read;
                    }
                }
            }
            // Every later op has a higher version than anything read so far.
            validator.push(None);
            if let Some(found) = validator.op_with_unique_version() {
                anchor = Some(found.index);
                break;
            }
            if fetched == 0 && lo > to {
                break;
            }
            let Some(next) = hi.checked_add(1) else {
                break;
            };
            lo = next;
            hi = hi.saturating_add(window);
        }

        let Some(anchor) = anchor else {
            debug!(collection, id, from, to, "no unique op past range; reading from snapshot link");
            return self.get_ops_strict(collection, id, from, Some(to), options);
        };
        let chain = get_linked_ops(&records, Some(to), Some(records[anchor].id));
        if !options.ignore_missing_ops {
            check_ops_from(collection, id, &chain, from, false)?;
        }
        Ok(into_ops(chain))
    }

    /// Ops for many documents, reading snapshot links and ops once each.
    pub fn get_ops_bulk(
        &self,
        collection: &str,
        from_map: &HashMap<DocId, Version>,
        to_map: Option<&HashMap<DocId, Version>>,
        options: ReadOptions,
    ) -> Result<HashMap<DocId, Vec<Op>>, DbError> {
        validate_collection_name(collection)?;
        let ids: Vec<&str> = from_map.keys().map(String::as_str).collect();
        let links = self.snapshot_links(collection, &ids)?;

        let mut out: HashMap<DocId, Vec<Op>> = HashMap::with_capacity(from_map.len());
        let mut pending = Vec::new();
        let mut conditions = Vec::new();
        for (id, &from) in from_map {
            let to = to_map.and_then(|m| m.get(id)).copied();
            let up_to_date = links.get(id).is_some_and(|link| link.v <= from);
            if up_to_date || to.is_some_and(|to| to <= from) {
                out.insert(id.clone(), Vec::new());
                continue;
            }
            conditions.push(json!({ DOC_FIELD: id, VERSION_FIELD: { "$gte": from } }));
            pending.push((id, from, to));
        }
        if pending.is_empty() {
            return Ok(out);
        }

        let find = FindOptions {
            sort: vec![
                (DOC_FIELD.to_string(), SortOrder::Ascending),
                (VERSION_FIELD.to_string(), SortOrder::Ascending),
            ],
            ..FindOptions::default()
        }
        .with_projection(op_projection(options.metadata));
        let rows = self
            .engine
            .find_many(&ops_collection(collection), &json!({ "$or": conditions }), &find)?;

        let mut by_doc: HashMap<DocId, Vec<OpRecord>> = HashMap::new();
        for row in rows {
            let record = OpRecord::from_row(row)?;
            by_doc.entry(record.doc_id.clone()).or_default().push(record);
        }

        for (id, from, to) in pending {
            let records = by_doc.remove(id.as_str()).unwrap_or_default();
            let link = links.get(id);
            let chain = filter_ops(collection, id, &records, link, to)?;
            if !options.ignore_missing_ops {
                check_ops_from(collection, id, &chain, from, link.is_none())?;
            }
            out.insert(id.clone(), into_ops(chain));
        }
        Ok(out)
    }

    /// Ops from `from` up to the version of `snapshot`, following the
    /// snapshot's own op link.
    pub fn get_ops_to_snapshot(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        snapshot: &Snapshot,
        options: ReadOptions,
    ) -> Result<Vec<Op>, DbError> {
        validate_collection_name(collection)?;
        let Some(link) = snapshot.op_link else {
            return Err(DbError::MissingOpLink {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        if snapshot.v <= from {
            return Ok(Vec::new());
        }
        let records = self.read_ops_from(collection, id, from, options)?;
        let chain = get_linked_ops(&records, None, Some(link));
        if !options.ignore_missing_ops {
            check_ops_from(collection, id, &chain, from, false)?;
        }
        Ok(into_ops(chain))
    }

    /// Version at which `op` (matched by `src` and `seq`) was committed on
    /// the chain leading to `snapshot`, if it was.
    pub fn get_committed_op_version(
        &self,
        collection: &str,
        id: &str,
        snapshot: &Snapshot,
        op: &Op,
    ) -> Result<Option<Version>, DbError> {
        validate_collection_name(collection)?;
        let (Some(src), Some(seq)) = (op.src.as_deref(), op.seq) else {
            return Ok(None);
        };
        let filter = json!({ DOC_FIELD: id, "src": src, "seq": seq });
        let find = FindOptions::sorted_by(VERSION_FIELD).with_limit(1);
        let earliest = self
            .engine
            .find_many(&ops_collection(collection), &filter, &find)?
            .into_iter()
            .next();
        let Some(row) = earliest else {
            return Ok(None);
        };
        let from = OpRecord::from_row(row)?.v;

        let ops = self.get_ops_to_snapshot(collection, id, from, snapshot, ReadOptions::default())?;
        Ok(ops
            .iter()
            .rev()
            .find(|candidate| candidate.src.as_deref() == Some(src) && candidate.seq == Some(seq))
            .and_then(|candidate| candidate.v))
    }
}
