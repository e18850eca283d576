//! Copy-aware path history and revision log
//!
//! History walks node-revision ancestry backwards. A node-revision committed
//! at the path being followed contributes its own revision; one that was
//! committed elsewhere is visible at the path only because an ancestor
//! directory was copied, so the walk finds that copy and continues at the
//! copy source.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db;
use crate::error::{FsError, Result};
use crate::object::{ChangedPath, CopyFrom, ObjectId, Revnum};
use crate::path;
use crate::properties::svn_props;
use crate::revision::resolve;
use crate::store::StoreInner;

/// One history record: the path as it was named in `rev`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub path: String,
    pub rev: Revnum,
}

impl HistoryEntry {
    fn new(path: &str, rev: Revnum) -> Self {
        Self {
            path: path.to_string(),
            rev,
        }
    }
}

/// Resumable position of a history walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    /// Path being followed
    path: String,
    /// Revision whose tree `path` is interpreted in
    view_rev: Revnum,
    /// Next node-revision to examine; `None` once the walk is over
    node: Option<ObjectId>,
    last_emitted: Option<Revnum>,
    cross_copies: bool,
    remaining: Option<usize>,
}

impl HistoryCursor {
    /// True when the walk has nothing left to produce
    pub fn is_finished(&self) -> bool {
        self.node.is_none()
    }

    /// The same position with a new entry limit
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.remaining = limit;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Lazy newest-first history of a path
pub struct History {
    inner: Arc<StoreInner>,
    state: HistoryCursor,
}

impl History {
    pub(crate) fn start(
        inner: Arc<StoreInner>,
        p: &str,
        rev: Revnum,
        limit: Option<usize>,
        cross_copies: bool,
    ) -> Result<Self> {
        let p = path::canonicalize(p)?;
        let root = inner.revision_root_id(rev)?;
        let entry = resolve(&inner, root, &p)?.ok_or_else(|| FsError::NotFound(p.clone()))?;
        Ok(Self {
            inner,
            state: HistoryCursor {
                path: p,
                view_rev: rev,
                node: Some(entry.id),
                last_emitted: None,
                cross_copies,
                remaining: limit,
            },
        })
    }

    pub(crate) fn resume(inner: Arc<StoreInner>, cursor: HistoryCursor) -> Self {
        Self {
            inner,
            state: cursor,
        }
    }

    /// Position from which `Store::resume_history` continues this walk
    pub fn cursor(&self) -> HistoryCursor {
        self.state.clone()
    }

    fn stop(&mut self) {
        self.state.node = None;
    }

    /// Emit `rev` unless the walk already produced it (or something older)
    fn emit(&mut self, rev: Revnum) -> Option<HistoryEntry> {
        if self.state.last_emitted.is_some_and(|last| rev >= last) {
            return None;
        }
        self.state.last_emitted = Some(rev);
        if let Some(n) = self.state.remaining.as_mut() {
            *n -= 1;
        }
        Some(HistoryEntry::new(&self.state.path, rev))
    }

    fn step(&mut self) -> Result<Option<HistoryEntry>> {
        loop {
            if self.state.remaining == Some(0) {
                return Ok(None);
            }
            let Some(id) = self.state.node else {
                return Ok(None);
            };
            let node = self.inner.nodes.get(&id)?;

            if node.created_path == self.state.path {
                let emitted = self.emit(node.created_rev);
                match (&node.copy_from, node.predecessor) {
                    (Some(_), Some(_)) if !self.state.cross_copies => self.stop(),
                    (Some(cf), Some(pred)) => {
                        tracing::debug!(from = %self.state.path, to = %cf.path, rev = cf.rev, "history follows copy");
                        self.state.path = cf.path.clone();
                        self.state.view_rev = cf.rev;
                        self.state.node = Some(pred);
                    }
                    (None, Some(pred)) => {
                        self.state.view_rev = node.created_rev;
                        self.state.node = Some(pred);
                    }
                    (_, None) => self.stop(),
                }
                if emitted.is_some() {
                    return Ok(emitted);
                }
                continue;
            }

            // Reached through a copied ancestor directory
            match self.find_copy_root(node.created_rev)? {
                Some((anchor, cf, copy_rev)) => {
                    let emitted = self.emit(copy_rev);
                    if self.state.cross_copies {
                        self.state.path = path::rebase(&self.state.path, &anchor, &cf.path);
                        self.state.view_rev = cf.rev;
                    } else {
                        self.stop();
                    }
                    if emitted.is_some() {
                        return Ok(emitted);
                    }
                }
                None => {
                    // No copy record between the path and the node; follow
                    // the node to where it was committed.
                    self.state.path = node.created_path.clone();
                }
            }
        }
    }

    /// Nearest ancestor of the current path that was copied after
    /// `min_rev`, as (ancestor path, copy source, copy revision)
    fn find_copy_root(&self, min_rev: Revnum) -> Result<Option<(String, CopyFrom, Revnum)>> {
        let root = self.inner.revision_root_id(self.state.view_rev)?;
        for anc in path::ancestors(&self.state.path) {
            let Some(entry) = resolve(&self.inner, root, anc)? else {
                continue;
            };
            let mut cur = Some(entry.id);
            while let Some(id) = cur {
                let node = self.inner.nodes.get(&id)?;
                if node.created_path != anc || node.created_rev <= min_rev {
                    break;
                }
                if let Some(cf) = &node.copy_from {
                    return Ok(Some((anc.to_string(), cf.clone(), node.created_rev)));
                }
                cur = node.predecessor;
            }
        }
        Ok(None)
    }
}

impl Iterator for History {
    type Item = Result<HistoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.stop();
                Some(Err(e))
            }
        }
    }
}

/// One revision of a log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub rev: Revnum,
    /// Path of the logged node in this revision
    pub path: String,
    pub author: Option<String>,
    pub date: Option<String>,
    pub message: Option<String>,
    /// Present when changed-path discovery was requested
    pub changed_paths: Option<Vec<ChangedPath>>,
}

/// Lazy newest-first revision log
pub struct Log {
    inner: Arc<StoreInner>,
    history: History,
    oldest: Revnum,
    discover_changed_paths: bool,
    remaining: Option<usize>,
}

impl Log {
    pub(crate) fn new(
        inner: Arc<StoreInner>,
        history: History,
        oldest: Revnum,
        discover_changed_paths: bool,
        limit: Option<usize>,
    ) -> Self {
        Self {
            inner,
            history,
            oldest,
            discover_changed_paths,
            remaining: limit,
        }
    }

    fn entry(&self, item: HistoryEntry) -> Result<LogEntry> {
        let conn = self.inner.db.read();
        let mut props = db::conn_revprops(&conn, item.rev)?;
        let changed_paths = if self.discover_changed_paths {
            Some(db::conn_changes(&conn, item.rev)?)
        } else {
            None
        };
        Ok(LogEntry {
            rev: item.rev,
            path: item.path,
            author: props.remove(svn_props::AUTHOR),
            date: props.remove(svn_props::DATE),
            message: props.remove(svn_props::LOG),
            changed_paths,
        })
    }
}

impl Iterator for Log {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        let item = match self.history.next()? {
            Ok(item) => item,
            Err(e) => return Some(Err(e)),
        };
        if item.rev < self.oldest {
            self.remaining = Some(0);
            return None;
        }
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(self.entry(item))
    }
}
