//! SQLite-backed storage engine.
//!
//! Rows are stored as JSON text in a single table keyed by
//! `(collection, key)`. Equality on `_id`, and on `d` in op-log collections,
//! is pushed into SQL; every other clause is evaluated in process.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, ErrorCode, params, params_from_iter};
use serde_json::{Value, json};

use super::{EngineError, EngineResult, FindOptions, StorageEngine, filter, row_key};
use crate::{op::DOC_FIELD, types::{Row, Version}};

/// SQLite implementation of [`StorageEngine`].
pub struct SqliteEngine {
    conn: Mutex<Connection>,
}

struct Prefilter {
    sql: String,
    args: Vec<String>,
}

impl SqliteEngine {
    /// Opens or creates a database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EngineError::Poisoned)
    }

    fn load(&self, collection: &str, filter: &Value) -> EngineResult<(Vec<Row>, Prefilter)> {
        let pre = prefilter(collection, filter);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&pre.sql)?;
        let bodies = stmt.query_map(params_from_iter(pre.args.iter()), |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for body in bodies {
            out.push(serde_json::from_str::<Row>(&body?)?);
        }
        Ok((out, pre))
    }
}

fn prefilter(collection: &str, filter: &Value) -> Prefilter {
    let mut sql = "SELECT body FROM rows WHERE collection = ?".to_string();
    let mut args = vec![collection.to_string()];

    if let Value::Object(clauses) = filter {
        match clauses.get("_id") {
            Some(Value::String(key)) => {
                sql.push_str(" AND key = ?");
                args.push(key.clone());
            }
            Some(Value::Object(cond)) if cond.len() == 1 => {
                if let Some(Value::Array(ids)) = cond.get("$in") {
                    let keys: Option<Vec<String>> = ids.iter().map(|v| v.as_str().map(str::to_string)).collect();
                    if let Some(keys) = keys {
                        if keys.is_empty() {
                            sql.push_str(" AND 0");
                        } else {
                            let marks = vec!["?"; keys.len()].join(", ");
                            sql.push_str(&format!(" AND key IN ({marks})"));
                            args.extend(keys);
                        }
                    }
                }
            }
            _ => {}
        }
        let op_log = collection.starts_with("o_");
        if let (true, Some(Value::String(doc))) = (op_log, clauses.get(DOC_FIELD)) {
            sql.push_str(" AND json_extract(body, '$.d') = ?");
            args.push(doc.clone());
        }
    }

    sql.push_str(" ORDER BY seq ASC");
    Prefilter { sql, args }
}

impl StorageEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn find_many(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Vec<Row>> {
        let (rows, _) = self.load(collection, filter)?;
        filter::select_rows(rows, filter, options)
    }

    fn insert(&self, collection: &str, row: Row) -> EngineResult<()> {
        let key = row_key(&row)?;
        let body = serde_json::to_string(&row)?;
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO rows(collection, key, body) VALUES (?1, ?2, ?3)",
            params![collection, key, body],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                Err(EngineError::UniquenessConflict {
                    collection: collection.to_string(),
                    key,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn compare_and_swap(&self, collection: &str, key: &str, expected_version: Version, mut row: Row) -> EngineResult<u64> {
        row.insert("_id".to_string(), Value::String(key.to_string()));
        let body = serde_json::to_string(&row)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE rows SET body = ?1 WHERE collection = ?2 AND key = ?3 AND json_extract(body, '$._v') = ?4",
            params![body, collection, key, expected_version as i64],
        )?;
        Ok(changed as u64)
    }

    fn delete(&self, collection: &str, key: &str) -> EngineResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM rows WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(changed as u64)
    }

    fn explain(&self, collection: &str, filter: &Value, options: &FindOptions) -> EngineResult<Value> {
        let (rows, pre) = self.load(collection, filter)?;
        let scanned = rows.len();
        let matched = filter::select_rows(rows, filter, options)?.len();

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", pre.sql))?;
        let details = stmt.query_map(params_from_iter(pre.args.iter()), |row| row.get::<_, String>(3))?;
        let mut plan = Vec::new();
        for detail in details {
            plan.push(Value::String(detail?));
        }

        Ok(json!({
            "engine": self.name(),
            "collection": collection,
            "plan": plan,
            "scanned": scanned,
            "matched": matched,
        }))
    }
}
