//! Read access to committed revisions

use std::collections::btree_map;
use std::sync::Arc;

use crate::blob::FileContents;
use crate::config::{Depth, ListOptions};
use crate::db;
use crate::error::{FsError, Result};
use crate::object::{ChangedPath, DirEntry, NodeKind, NodeRevision, ObjectId, Revnum};
use crate::path;
use crate::properties::PropertySet;
use crate::store::StoreInner;

/// Resolve a canonical path below a root node-revision
pub(crate) fn resolve(inner: &StoreInner, root: ObjectId, p: &str) -> Result<Option<DirEntry>> {
    let mut cur = DirEntry {
        kind: NodeKind::Directory,
        id: root,
    };
    for name in path::components(p) {
        if cur.kind != NodeKind::Directory {
            return Ok(None);
        }
        let node = inner.nodes.get(&cur.id)?;
        match node.entries()?.get(name) {
            Some(entry) => cur = *entry,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

/// An immutable snapshot of the tree at one revision
#[derive(Clone)]
pub struct RevisionRoot {
    inner: Arc<StoreInner>,
    rev: Revnum,
    root: ObjectId,
}

impl std::fmt::Debug for RevisionRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionRoot")
            .field("rev", &self.rev)
            .field("root", &self.root.short())
            .finish()
    }
}

impl RevisionRoot {
    pub(crate) fn open(inner: Arc<StoreInner>, rev: Revnum) -> Result<Self> {
        let root = inner.revision_root_id(rev)?;
        Ok(Self { inner, rev, root })
    }

    pub fn rev(&self) -> Revnum {
        self.rev
    }

    /// Id of the root directory's node-revision
    pub fn root_id(&self) -> ObjectId {
        self.root
    }

    fn entry(&self, p: &str) -> Result<(String, DirEntry)> {
        let p = path::canonicalize(p)?;
        match resolve(&self.inner, self.root, &p)? {
            Some(entry) => Ok((p, entry)),
            None => Err(FsError::NotFound(p)),
        }
    }

    /// The node-revision at `p`
    pub fn node(&self, p: &str) -> Result<Arc<NodeRevision>> {
        let (_, entry) = self.entry(p)?;
        self.inner.nodes.get(&entry.id)
    }

    /// Kind of the node at `p`, `None` when nothing is there
    pub fn check_path(&self, p: &str) -> Result<Option<NodeKind>> {
        let p = path::canonicalize(p)?;
        Ok(resolve(&self.inner, self.root, &p)?.map(|e| e.kind))
    }

    pub fn is_file(&self, p: &str) -> Result<bool> {
        Ok(self.check_path(p)? == Some(NodeKind::File))
    }

    pub fn is_dir(&self, p: &str) -> Result<bool> {
        Ok(self.check_path(p)? == Some(NodeKind::Directory))
    }

    /// Streamed contents of the file at `p`
    pub fn read_content(&self, p: &str) -> Result<FileContents> {
        let node = self.node(p)?;
        let rep = node.text()?.cloned();
        Ok(FileContents::new(
            Arc::clone(&self.inner.blobs),
            rep,
            self.inner.config.read_chunk_size,
        ))
    }

    /// Immediate entries of the directory at `p`
    pub fn list_dir(&self, p: &str) -> Result<DirEntries> {
        self.list_dir_with(p, ListOptions::default())
    }

    pub fn list_dir_with(&self, p: &str, options: ListOptions) -> Result<DirEntries> {
        let (p, entry) = self.entry(p)?;
        let node = self.inner.nodes.get(&entry.id)?;
        let entries = node.entries()?.clone();
        Ok(DirEntries {
            inner: Arc::clone(&self.inner),
            stack: vec![(p, entries.into_iter())],
            depth: options.depth,
        })
    }

    pub fn node_props(&self, p: &str) -> Result<PropertySet> {
        Ok(self.node(p)?.props.clone())
    }

    pub fn node_prop(&self, p: &str, name: &str) -> Result<Option<String>> {
        Ok(self.node(p)?.props.get(name).cloned())
    }

    /// Revision in which the node at `p` last changed
    pub fn node_created_rev(&self, p: &str) -> Result<Revnum> {
        Ok(self.node(p)?.created_rev)
    }

    pub fn file_length(&self, p: &str) -> Result<u64> {
        Ok(self.node(p)?.text()?.map_or(0, |rep| rep.size))
    }

    /// Hex SHA-1 of the file at `p`
    pub fn file_checksum(&self, p: &str) -> Result<String> {
        Ok(self.read_content(p)?.sha1())
    }

    /// Paths changed by this revision
    pub fn paths_changed(&self) -> Result<Vec<ChangedPath>> {
        let conn = self.inner.db.read();
        db::conn_changes(&conn, self.rev)
    }
}

/// One directory listing record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListEntry {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    pub id: ObjectId,
    /// Revision in which the entry last changed
    pub created_rev: Revnum,
    /// Content length, files only
    pub size: Option<u64>,
}

/// Lazy directory listing in name order (pre-order for `Depth::Infinity`)
pub struct DirEntries {
    inner: Arc<StoreInner>,
    stack: Vec<(String, btree_map::IntoIter<String, DirEntry>)>,
    depth: Depth,
}

impl std::fmt::Debug for DirEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirEntries")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Iterator for DirEntries {
    type Item = Result<DirListEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (dir, iter) = self.stack.last_mut()?;
            let Some((name, entry)) = iter.next() else {
                self.stack.pop();
                continue;
            };
            let entry_path = path::join(dir, &name);
            let node = match self.inner.nodes.get(&entry.id) {
                Ok(node) => node,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };
            let size = match node.text() {
                Ok(text) => Some(text.map_or(0, |rep| rep.size)),
                Err(_) => None,
            };
            if self.depth == Depth::Infinity {
                if let Ok(children) = node.entries() {
                    self.stack
                        .push((entry_path.clone(), children.clone().into_iter()));
                }
            }
            return Some(Ok(DirListEntry {
                name,
                path: entry_path,
                kind: entry.kind,
                id: entry.id,
                created_rev: node.created_rev,
                size,
            }));
        }
    }
}
