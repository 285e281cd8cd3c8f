//! Hierarchical JSON data tree stored in SQLite.
//!
//! Each row of `tree_nodes` holds the JSON value of one subtree. Reads
//! assemble a value either from the row that covers the path or from every
//! row beneath it. Writes go through [`TreeTxn`], run under `BEGIN
//! IMMEDIATE`, and publish the written paths to subscribers after commit.

mod path;
mod watch;

pub use path::{DataPath, PathError};
pub use watch::{Snapshot, Subscription};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::db::models::Keyed;
use crate::state::DbPool;

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("Invalid path: {0}")]
    Path(#[from] PathError),

    #[error("The root of the tree cannot be written")]
    RootWrite,

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct DataTree {
    pool: DbPool,
    changes: broadcast::Sender<DataPath>,
}

impl DataTree {
    pub fn new(pool: DbPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { pool, changes }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Read `path` from a single snapshot, even when it spans several rows.
    pub fn get(&self, path: &DataPath) -> Result<Option<Value>, TreeError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = read_value(&tx, path)?;
        tx.finish()?;
        Ok(value)
    }

    pub fn get_as<T: DeserializeOwned>(&self, path: &DataPath) -> Result<Option<T>, TreeError> {
        decode(self.get(path)?)
    }

    /// Children of `path` decoded as `T`, ordered by key. Children that do
    /// not decode are skipped.
    pub fn children_as<T: DeserializeOwned>(
        &self,
        path: &DataPath,
    ) -> Result<Vec<Keyed<T>>, TreeError> {
        Ok(decode_children(path, self.get(path)?))
    }

    pub fn set<T: Serialize>(&self, path: &DataPath, value: &T) -> Result<(), TreeError> {
        self.transaction(|txn| txn.set(path, value))
    }

    pub fn update(&self, path: &DataPath, fields: Map<String, Value>) -> Result<(), TreeError> {
        self.transaction(|txn| txn.update(path, fields))
    }

    pub fn remove(&self, path: &DataPath) -> Result<(), TreeError> {
        self.transaction(|txn| txn.remove(path))
    }

    pub fn push<T: Serialize>(&self, parent: &DataPath, value: &T) -> Result<DataPath, TreeError> {
        self.transaction(|txn| txn.push(parent, value))
    }

    /// Run `f` in a single write transaction. Nothing `f` writes is visible
    /// to other readers, or announced to subscribers, unless it returns `Ok`.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TreeTxn<'_>) -> Result<T, E>,
        E: From<TreeError>,
    {
        let mut conn = self.pool.get().map_err(TreeError::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(TreeError::from)?;

        let mut txn = TreeTxn {
            tx,
            changed: Vec::new(),
        };
        let out = f(&mut txn)?;

        let TreeTxn { tx, mut changed } = txn;
        tx.commit().map_err(TreeError::from)?;

        changed.sort();
        changed.dedup();
        for path in changed {
            tracing::debug!(path = %path, "tree changed");
            // Having no subscribers is not an error
            let _ = self.changes.send(path);
        }

        Ok(out)
    }

    pub fn subscribe(&self, path: DataPath) -> Subscription {
        tracing::debug!(path = %path, "subscribed");
        Subscription::new(self.clone(), path, self.changes.subscribe())
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }
}

/// Handle for reads and writes inside [`DataTree::transaction`].
pub struct TreeTxn<'c> {
    tx: rusqlite::Transaction<'c>,
    changed: Vec<DataPath>,
}

impl TreeTxn<'_> {
    pub fn get(&self, path: &DataPath) -> Result<Option<Value>, TreeError> {
        read_value(&self.tx, path)
    }

    pub fn get_as<T: DeserializeOwned>(&self, path: &DataPath) -> Result<Option<T>, TreeError> {
        decode(self.get(path)?)
    }

    /// The underlying connection, for writes to tables beside the tree that
    /// must commit together with it.
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn set<T: Serialize>(&mut self, path: &DataPath, value: &T) -> Result<(), TreeError> {
        let value = serde_json::to_value(value)?;
        self.write(path, normalize(value))
    }

    /// Shallow merge into the object at `path`. `null` fields are deleted.
    pub fn update(&mut self, path: &DataPath, fields: Map<String, Value>) -> Result<(), TreeError> {
        let mut current = match self.get(path)? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in fields {
            path.child(&key)?;
            if value.is_null() {
                current.remove(&key);
            } else {
                current.insert(key, value);
            }
        }
        self.write(path, normalize(Value::Object(current)))
    }

    pub fn remove(&mut self, path: &DataPath) -> Result<(), TreeError> {
        self.write(path, None)
    }

    /// Store `value` under a new time-ordered key below `parent`.
    pub fn push<T: Serialize>(&mut self, parent: &DataPath, value: &T) -> Result<DataPath, TreeError> {
        let path = parent.child(&uuid::Uuid::now_v7().to_string())?;
        self.set(&path, value)?;
        Ok(path)
    }

    fn write(&mut self, path: &DataPath, value: Option<Value>) -> Result<(), TreeError> {
        if path.is_root() {
            return Err(TreeError::RootWrite);
        }

        // A row above us owns this location: rewrite it in place
        for ancestor in path.ancestors() {
            if let Some(mut holder) = select_row(&self.tx, &ancestor)? {
                set_within(&mut holder, &path.relative_to(&ancestor), value);
                match normalize(holder) {
                    Some(v) => upsert_row(&self.tx, &ancestor, &v)?,
                    None => delete_row(&self.tx, &ancestor)?,
                }
                self.changed.push(path.clone());
                return Ok(());
            }
        }

        delete_descendants(&self.tx, path)?;
        match value {
            Some(v) => upsert_row(&self.tx, path, &v)?,
            None => delete_row(&self.tx, path)?,
        }
        self.changed.push(path.clone());
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>, TreeError> {
    Ok(value.map(serde_json::from_value).transpose()?)
}

fn decode_children<T: DeserializeOwned>(path: &DataPath, value: Option<Value>) -> Vec<Keyed<T>> {
    let Some(Value::Object(children)) = value else {
        return Vec::new();
    };
    children
        .into_iter()
        .filter_map(|(id, child)| match serde_json::from_value(child) {
            Ok(value) => Some(Keyed { id, value }),
            Err(e) => {
                tracing::warn!(path = %path, key = %id, "skipping malformed record: {}", e);
                None
            }
        })
        .collect()
}

fn read_value(conn: &Connection, path: &DataPath) -> Result<Option<Value>, TreeError> {
    if !path.is_root() {
        let mut holders = path.ancestors();
        holders.push(path.clone());
        for holder_path in holders {
            if let Some(holder) = select_row(conn, &holder_path)? {
                return Ok(descend(holder, &path.relative_to(&holder_path)));
            }
        }
    }

    let rows = select_descendants(conn, path)?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut assembled = Value::Object(Map::new());
    for (row_path, value) in rows {
        set_within(&mut assembled, &row_path.relative_to(path), Some(value));
    }
    Ok(Some(assembled))
}

/// Drop nulls and empty objects. `None` means nothing is left to store.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

fn descend(mut value: Value, relative: &[String]) -> Option<Value> {
    for segment in relative {
        value = match value {
            Value::Object(mut map) => map.remove(segment)?,
            _ => return None,
        };
    }
    (!value.is_null()).then_some(value)
}

fn set_within(holder: &mut Value, relative: &[String], value: Option<Value>) {
    let Some((last, parents)) = relative.split_last() else {
        return;
    };
    let mut cursor = holder;
    for segment in parents {
        cursor = as_object(cursor)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = as_object(cursor);
    match value {
        Some(v) => {
            map.insert(last.clone(), v);
        }
        None => {
            map.remove(last);
        }
    }
}

fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

// --- Row helpers ---

/// Bounds of every path strictly below `path`. `'0'` is the byte after `'/'`.
fn descendant_range(path: &DataPath) -> (String, String) {
    (format!("{}/", path.as_str()), format!("{}0", path.as_str()))
}

fn select_row(conn: &Connection, path: &DataPath) -> Result<Option<Value>, TreeError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM tree_nodes WHERE path = ?1",
            params![path.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn select_descendants(
    conn: &Connection,
    path: &DataPath,
) -> Result<Vec<(DataPath, Value)>, TreeError> {
    let rows: Vec<(String, String)> = if path.is_root() {
        let mut stmt = conn.prepare("SELECT path, value FROM tree_nodes ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        rows
    } else {
        let (lo, hi) = descendant_range(path);
        let mut stmt = conn.prepare(
            "SELECT path, value FROM tree_nodes WHERE path > ?1 AND path < ?2 ORDER BY path",
        )?;
        let rows = stmt
            .query_map(params![lo, hi], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        rows
    };

    rows.into_iter()
        .map(|(p, v)| Ok((DataPath::parse(&p)?, serde_json::from_str(&v)?)))
        .collect()
}

fn upsert_row(conn: &Connection, path: &DataPath, value: &Value) -> Result<(), TreeError> {
    conn.execute(
        "INSERT INTO tree_nodes (path, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(path) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![path.as_str(), serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, path: &DataPath) -> Result<(), TreeError> {
    conn.execute(
        "DELETE FROM tree_nodes WHERE path = ?1",
        params![path.as_str()],
    )?;
    Ok(())
}

fn delete_descendants(conn: &Connection, path: &DataPath) -> Result<(), TreeError> {
    let (lo, hi) = descendant_range(path);
    conn.execute(
        "DELETE FROM tree_nodes WHERE path > ?1 AND path < ?2",
        params![lo, hi],
    )?;
    Ok(())
}
