//! SQLite metadata database
//!
//! Holds everything except file content: node-revisions, the revision table,
//! revision properties with their change journal, per-revision changed paths
//! and the node-id counter. WAL mode lets readers proceed while a commit
//! holds the write lock.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;

use crate::error::{FsError, Result};
use crate::object::{ChangeAction, ChangedPath, CopyFrom, NodeId, NodeKind, ObjectId, Revnum};
use crate::properties::{PropertySet, RevpropChange};

/// Database file name inside a store
pub const DB_FILE: &str = "revfs.sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS nodes (
    id BLOB PRIMARY KEY,
    data BLOB NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS revisions (
    rev INTEGER PRIMARY KEY,
    root BLOB NOT NULL,
    txn_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS revprops (
    rev INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (rev, name)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS revprop_journal (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    rev INTEGER NOT NULL,
    name TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    changed_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS changes (
    rev INTEGER NOT NULL,
    path TEXT NOT NULL,
    action TEXT NOT NULL,
    kind TEXT NOT NULL,
    text_mod INTEGER NOT NULL,
    prop_mod INTEGER NOT NULL,
    copy_path TEXT,
    copy_rev INTEGER,
    PRIMARY KEY (rev, path)
) WITHOUT ROWID;
";

const NEXT_NODE_ID: &str = "next_node_id";

fn open_conn(root: &Path) -> Result<Connection> {
    let conn = Connection::open(root.join(DB_FILE))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-16000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(Duration::from_secs(30))?;
    Ok(conn)
}

fn kind_to_sql(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::File => "file",
        NodeKind::Directory => "dir",
    }
}

fn kind_from_sql(s: &str) -> Result<NodeKind> {
    match s {
        "file" => Ok(NodeKind::File),
        "dir" => Ok(NodeKind::Directory),
        other => Err(FsError::Corrupt(format!("unknown node kind '{}'", other))),
    }
}

/// Writer and reader connections of one store
///
/// The writer mutex doubles as the in-process commit lock; an IMMEDIATE
/// SQLite transaction extends it across processes.
pub struct Db {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Db {
    /// Create the schema in a fresh store directory
    pub fn create(root: &Path) -> Result<Self> {
        let conn = open_conn(root)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, 1)",
            params![NEXT_NODE_ID],
        )?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: Mutex::new(open_conn(root)?),
        })
    }

    /// Open an existing store database
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(DB_FILE).exists() {
            return Err(FsError::NoStore(root.to_path_buf()));
        }
        Ok(Self {
            writer: Mutex::new(open_conn(root)?),
            reader: Mutex::new(open_conn(root)?),
        })
    }

    pub fn read(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock()
    }

    pub fn write(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }
}

/// Youngest committed revision
pub fn conn_youngest(conn: &Connection) -> Result<Revnum> {
    let max: Option<i64> = conn.query_row("SELECT MAX(rev) FROM revisions", [], |r| r.get(0))?;
    max.map(|r| r as Revnum)
        .ok_or_else(|| FsError::Corrupt("revision table is empty".into()))
}

pub fn conn_revision_root(conn: &Connection, rev: Revnum) -> Result<Option<ObjectId>> {
    let root: Option<Vec<u8>> = conn
        .query_row(
            "SELECT root FROM revisions WHERE rev = ?1",
            params![rev as i64],
            |r| r.get(0),
        )
        .optional()?;
    root.map(|b| ObjectId::from_slice(&b)).transpose()
}

pub fn conn_insert_revision(conn: &Connection, rev: Revnum, root: &ObjectId, txn_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO revisions (rev, root, txn_id) VALUES (?1, ?2, ?3)",
        params![rev as i64, root.as_bytes().as_slice(), txn_id],
    )?;
    Ok(())
}

pub fn conn_get_node(conn: &Connection, id: &ObjectId) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT data FROM nodes WHERE id = ?1",
            params![id.as_bytes().as_slice()],
            |r| r.get(0),
        )
        .optional()?)
}

/// Node-revisions are immutable; storing the same id twice is a no-op
pub fn conn_put_node(conn: &Connection, id: &ObjectId, data: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO nodes (id, data) VALUES (?1, ?2)",
        params![id.as_bytes().as_slice(), data],
    )?;
    Ok(())
}

pub fn conn_node_count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
    Ok(n as u64)
}

/// Reserve `count` consecutive node ids and return the first
pub fn conn_alloc_node_ids(conn: &Connection, count: u64) -> Result<NodeId> {
    let next: i64 = conn.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![NEXT_NODE_ID],
        |r| r.get(0),
    )?;
    conn.execute(
        "UPDATE meta SET value = ?1 WHERE key = ?2",
        params![next + count as i64, NEXT_NODE_ID],
    )?;
    Ok(next as NodeId)
}

pub fn conn_revprops(conn: &Connection, rev: Revnum) -> Result<PropertySet> {
    let mut stmt = conn.prepare_cached("SELECT name, value FROM revprops WHERE rev = ?1")?;
    let rows = stmt
        .query_map(params![rev as i64], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().collect())
}

pub fn conn_revprop(conn: &Connection, rev: Revnum, name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM revprops WHERE rev = ?1 AND name = ?2",
            params![rev as i64, name],
            |r| r.get(0),
        )
        .optional()?)
}

/// Revision property written as part of a commit (not journaled)
pub fn conn_insert_revprop(conn: &Connection, rev: Revnum, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO revprops (rev, name, value) VALUES (?1, ?2, ?3)",
        params![rev as i64, name, value],
    )?;
    Ok(())
}

/// Change a revision property after the fact and journal the change
pub fn conn_set_revprop(
    conn: &Connection,
    rev: Revnum,
    name: &str,
    value: Option<&str>,
    changed_at: &str,
) -> Result<RevpropChange> {
    let old_value = conn_revprop(conn, rev, name)?;
    match value {
        Some(v) => conn_insert_revprop(conn, rev, name, v)?,
        None => {
            conn.execute(
                "DELETE FROM revprops WHERE rev = ?1 AND name = ?2",
                params![rev as i64, name],
            )?;
        }
    }
    conn.execute(
        "INSERT INTO revprop_journal (rev, name, old_value, new_value, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![rev as i64, name, old_value.as_deref(), value, changed_at],
    )?;
    Ok(RevpropChange {
        seq: conn.last_insert_rowid() as u64,
        rev,
        name: name.to_string(),
        old_value,
        new_value: value.map(str::to_string),
        changed_at: changed_at.to_string(),
    })
}

/// Journal entries, oldest first, optionally for one revision
pub fn conn_revprop_journal(conn: &Connection, rev: Option<Revnum>) -> Result<Vec<RevpropChange>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, rev, name, old_value, new_value, changed_at FROM revprop_journal
         WHERE ?1 IS NULL OR rev = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![rev.map(|r| r as i64)], |r| {
            Ok(RevpropChange {
                seq: r.get::<_, i64>(0)? as u64,
                rev: r.get::<_, i64>(1)? as Revnum,
                name: r.get(2)?,
                old_value: r.get(3)?,
                new_value: r.get(4)?,
                changed_at: r.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn conn_insert_change(conn: &Connection, rev: Revnum, change: &ChangedPath) -> Result<()> {
    let (copy_path, copy_rev) = match &change.copy_from {
        Some(cf) => (Some(cf.path.as_str()), Some(cf.rev as i64)),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO changes (rev, path, action, kind, text_mod, prop_mod, copy_path, copy_rev)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            rev as i64,
            change.path,
            change.action.code().to_string(),
            kind_to_sql(change.kind),
            change.text_mod,
            change.prop_mod,
            copy_path,
            copy_rev,
        ],
    )?;
    Ok(())
}

type ChangeRow = (String, String, String, bool, bool, Option<String>, Option<i64>);

/// Paths changed by one revision, in path order
pub fn conn_changes(conn: &Connection, rev: Revnum) -> Result<Vec<ChangedPath>> {
    let mut stmt = conn.prepare_cached(
        "SELECT path, action, kind, text_mod, prop_mod, copy_path, copy_rev
         FROM changes WHERE rev = ?1 ORDER BY path",
    )?;
    let rows = stmt
        .query_map(params![rev as i64], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<ChangeRow>>>()?;

    rows.into_iter()
        .map(|(path, action, kind, text_mod, prop_mod, copy_path, copy_rev)| {
            let copy_from = match (copy_path, copy_rev) {
                (Some(path), Some(rev)) => Some(CopyFrom {
                    path,
                    rev: rev as Revnum,
                }),
                _ => None,
            };
            Ok(ChangedPath {
                path,
                action: ChangeAction::from_code(&action)?,
                kind: kind_from_sql(&kind)?,
                text_mod,
                prop_mod,
                copy_from,
            })
        })
        .collect()
}

/// (rev, path) of every change committed after `base`
pub fn conn_changed_paths_after(conn: &Connection, base: Revnum) -> Result<Vec<(Revnum, String)>> {
    let mut stmt = conn.prepare_cached("SELECT rev, path FROM changes WHERE rev > ?1 ORDER BY rev")?;
    let rows = stmt
        .query_map(params![base as i64], |r| {
            Ok((r.get::<_, i64>(0)? as Revnum, r.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
