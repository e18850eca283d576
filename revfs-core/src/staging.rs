//! Mutable staging tree of a transaction
//!
//! A transaction starts from the root of its base revision. Untouched
//! subtrees stay as references to committed node-revisions; a mutation
//! copies every node on the path to the target into a mutable node. At
//! commit the tree is written out bottom-up as new node-revisions.

use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};

use crate::db;
use crate::error::{FsError, Result};
use crate::node_store::NodeStore;
use crate::object::{
    ChangeAction, ChangedPath, CopyFrom, DirEntry, Directory, NodeContent, NodeId, NodeKind,
    NodeRevision, ObjectId, Revnum, TextRep,
};
use crate::path;
use crate::properties::PropertySet;

/// A node in the staging tree
#[derive(Debug, Clone)]
pub(crate) enum TxnNode {
    /// Unchanged committed node-revision
    Committed(DirEntry),
    Mutable(Box<MutableNode>),
}

#[derive(Debug, Clone)]
pub(crate) struct MutableNode {
    /// `None` for nodes created in this transaction
    pub node_id: Option<NodeId>,
    pub props: PropertySet,
    pub content: MutableContent,
    pub predecessor: Option<ObjectId>,
    pub copy_from: Option<CopyFrom>,
}

#[derive(Debug, Clone)]
pub(crate) enum MutableContent {
    File(Option<TextRep>),
    Directory(BTreeMap<String, TxnNode>),
}

impl MutableNode {
    fn new(kind: NodeKind) -> Self {
        let content = match kind {
            NodeKind::File => MutableContent::File(None),
            NodeKind::Directory => MutableContent::Directory(BTreeMap::new()),
        };
        Self {
            node_id: None,
            props: PropertySet::new(),
            content,
            predecessor: None,
            copy_from: None,
        }
    }

    /// Successor of a committed node-revision
    fn from_committed(id: ObjectId, node: &NodeRevision) -> Self {
        let content = match &node.content {
            NodeContent::File(text) => MutableContent::File(text.clone()),
            NodeContent::Directory(dir) => MutableContent::Directory(
                dir.iter()
                    .map(|(name, entry)| (name.clone(), TxnNode::Committed(*entry)))
                    .collect(),
            ),
        };
        Self {
            node_id: Some(node.node_id),
            props: node.props.clone(),
            content,
            predecessor: Some(id),
            copy_from: None,
        }
    }

    fn kind(&self) -> NodeKind {
        match self.content {
            MutableContent::File(_) => NodeKind::File,
            MutableContent::Directory(_) => NodeKind::Directory,
        }
    }

    fn entries_mut(&mut self, path: &str) -> Result<&mut BTreeMap<String, TxnNode>> {
        match &mut self.content {
            MutableContent::Directory(entries) => Ok(entries),
            MutableContent::File(_) => Err(FsError::NotADirectory(path.to_string())),
        }
    }
}

/// One staged mutation, kept so the transaction can be replayed onto a
/// newer revision
#[derive(Debug, Clone)]
pub(crate) enum TxnOp {
    Mkdir(String),
    Mkfile(String),
    SetText {
        path: String,
        rep: Option<TextRep>,
    },
    SetProp {
        path: String,
        name: String,
        value: Option<String>,
    },
    Delete(String),
    Copy {
        from: CopyFrom,
        source: DirEntry,
        to: String,
    },
    Rename {
        from: String,
        to: String,
    },
}

impl TxnOp {
    /// Every path the operation visits when applied
    pub fn paths(&self) -> Vec<&str> {
        match self {
            TxnOp::Mkdir(p) | TxnOp::Mkfile(p) | TxnOp::Delete(p) => vec![p.as_str()],
            TxnOp::SetText { path, .. } | TxnOp::SetProp { path, .. } => vec![path.as_str()],
            TxnOp::Copy { to, .. } => vec![to.as_str()],
            TxnOp::Rename { from, to } => vec![from.as_str(), to.as_str()],
        }
    }
}

/// What an applied operation touched
#[derive(Debug, Clone)]
pub(crate) struct Applied {
    pub kind: NodeKind,
    /// Copy source recorded for the destination of a copy or rename
    pub copy_from: Option<CopyFrom>,
}

#[derive(Clone, Copy)]
enum NodeRef<'a> {
    Mutable(&'a MutableNode),
    Committed(DirEntry),
}

impl<'a> NodeRef<'a> {
    fn of(node: &'a TxnNode) -> Self {
        match node {
            TxnNode::Committed(entry) => NodeRef::Committed(*entry),
            TxnNode::Mutable(m) => NodeRef::Mutable(m),
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            NodeRef::Mutable(m) => m.kind(),
            NodeRef::Committed(entry) => entry.kind,
        }
    }

    fn child(self, nodes: &NodeStore, name: &str) -> Result<Option<NodeRef<'a>>> {
        match self {
            NodeRef::Mutable(m) => Ok(match &m.content {
                MutableContent::Directory(entries) => entries.get(name).map(NodeRef::of),
                MutableContent::File(_) => None,
            }),
            NodeRef::Committed(entry) if entry.kind == NodeKind::Directory => {
                let node = nodes.get(&entry.id)?;
                Ok(node.entries()?.get(name).copied().map(NodeRef::Committed))
            }
            NodeRef::Committed(_) => Ok(None),
        }
    }
}

fn make_mutable<'a>(node: &'a mut TxnNode, nodes: &NodeStore) -> Result<&'a mut MutableNode> {
    if let TxnNode::Committed(entry) = *node {
        let committed = nodes.get(&entry.id)?;
        *node = TxnNode::Mutable(Box::new(MutableNode::from_committed(entry.id, &committed)));
    }
    match node {
        TxnNode::Mutable(m) => Ok(m),
        TxnNode::Committed(entry) => Err(FsError::Corrupt(format!(
            "node-revision {} could not be staged",
            entry.id
        ))),
    }
}

fn split_non_root(p: &str) -> Result<(&str, &str)> {
    path::split(p).ok_or(FsError::RootPath)
}

#[derive(Debug, Clone)]
pub(crate) struct StagingTree {
    root: TxnNode,
    base_rev: Revnum,
}

impl StagingTree {
    pub fn new(root: ObjectId, base_rev: Revnum) -> Self {
        Self {
            root: TxnNode::Committed(DirEntry {
                kind: NodeKind::Directory,
                id: root,
            }),
            base_rev,
        }
    }

    /// Rebuild a tree by applying `ops` on top of another revision
    pub fn replay(root: ObjectId, rev: Revnum, nodes: &NodeStore, ops: &[TxnOp]) -> Result<Self> {
        let mut tree = Self::new(root, rev);
        for op in ops {
            tree.apply(nodes, op)?;
        }
        Ok(tree)
    }

    fn lookup(&self, nodes: &NodeStore, p: &str) -> Result<Option<NodeRef<'_>>> {
        let mut cur = NodeRef::of(&self.root);
        for name in path::components(p) {
            match cur.child(nodes, name)? {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    pub fn kind_at(&self, nodes: &NodeStore, p: &str) -> Result<Option<NodeKind>> {
        Ok(self.lookup(nodes, p)?.map(|n| n.kind()))
    }

    /// Copy-on-write walk to the node at `p`
    fn node_mut(&mut self, nodes: &NodeStore, p: &str) -> Result<&mut MutableNode> {
        let mut cur = make_mutable(&mut self.root, nodes)?;
        for name in path::components(p) {
            let child = cur
                .entries_mut(p)?
                .get_mut(name)
                .ok_or_else(|| FsError::NotFound(p.to_string()))?;
            cur = make_mutable(child, nodes)?;
        }
        Ok(cur)
    }

    /// Parent must be an existing directory and `p` itself must be free
    fn check_creatable(&self, nodes: &NodeStore, p: &str) -> Result<()> {
        let (parent, _) = split_non_root(p)?;
        match self.kind_at(nodes, parent)? {
            Some(NodeKind::Directory) => {}
            _ => return Err(FsError::NoSuchParent(p.to_string())),
        }
        if self.lookup(nodes, p)?.is_some() {
            return Err(FsError::AlreadyExists(p.to_string()));
        }
        Ok(())
    }

    fn existing_kind(&self, nodes: &NodeStore, p: &str) -> Result<NodeKind> {
        self.kind_at(nodes, p)?
            .ok_or_else(|| FsError::NotFound(p.to_string()))
    }

    /// Copy source to record when the node at `p` moves: the path it has in
    /// the revision its nearest copied ancestor-or-self came from, or the
    /// base revision. `None` for nodes added in this transaction.
    fn move_origin(&self, nodes: &NodeStore, p: &str) -> Result<Option<CopyFrom>> {
        let mut origin = Some((
            "/".to_string(),
            CopyFrom {
                path: "/".to_string(),
                rev: self.base_rev,
            },
        ));
        let mut cur = NodeRef::of(&self.root);
        let mut cur_path = "/".to_string();
        for name in path::components(p) {
            cur = cur
                .child(nodes, name)?
                .ok_or_else(|| FsError::NotFound(p.to_string()))?;
            cur_path = path::join(&cur_path, name);
            if let NodeRef::Mutable(m) = cur {
                if let Some(cf) = &m.copy_from {
                    origin = Some((cur_path.clone(), cf.clone()));
                } else if m.predecessor.is_none() {
                    origin = None;
                }
            }
        }
        Ok(origin.map(|(anchor, cf)| CopyFrom {
            path: path::rebase(p, &anchor, &cf.path),
            rev: cf.rev,
        }))
    }

    /// Validate and apply one operation. A failed operation leaves the tree
    /// as it was.
    pub fn apply(&mut self, nodes: &NodeStore, op: &TxnOp) -> Result<Applied> {
        match op {
            TxnOp::Mkdir(p) | TxnOp::Mkfile(p) => {
                let kind = if matches!(op, TxnOp::Mkdir(_)) {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                };
                self.check_creatable(nodes, p)?;
                let (parent, name) = split_non_root(p)?;
                self.node_mut(nodes, parent)?
                    .entries_mut(parent)?
                    .insert(name.to_string(), TxnNode::Mutable(Box::new(MutableNode::new(kind))));
                Ok(Applied {
                    kind,
                    copy_from: None,
                })
            }
            TxnOp::SetText { path: p, rep } => {
                if self.existing_kind(nodes, p)? != NodeKind::File {
                    return Err(FsError::NotAFile(p.to_string()));
                }
                let node = self.node_mut(nodes, p)?;
                node.content = MutableContent::File(rep.clone().filter(|r| r.size > 0));
                Ok(Applied {
                    kind: NodeKind::File,
                    copy_from: None,
                })
            }
            TxnOp::SetProp {
                path: p,
                name,
                value,
            } => {
                let kind = self.existing_kind(nodes, p)?;
                self.node_mut(nodes, p)?.props.apply(name, value.clone());
                Ok(Applied {
                    kind,
                    copy_from: None,
                })
            }
            TxnOp::Delete(p) => {
                let (parent, name) = split_non_root(p)?;
                let kind = self.existing_kind(nodes, p)?;
                self.node_mut(nodes, parent)?
                    .entries_mut(parent)?
                    .remove(name);
                Ok(Applied {
                    kind,
                    copy_from: None,
                })
            }
            TxnOp::Copy { from, source, to } => {
                self.check_creatable(nodes, to)?;
                let (parent, name) = split_non_root(to)?;
                let committed = nodes.get(&source.id)?;
                let mut node = MutableNode::from_committed(source.id, &committed);
                node.copy_from = Some(from.clone());
                self.node_mut(nodes, parent)?
                    .entries_mut(parent)?
                    .insert(name.to_string(), TxnNode::Mutable(Box::new(node)));
                Ok(Applied {
                    kind: source.kind,
                    copy_from: Some(from.clone()),
                })
            }
            TxnOp::Rename { from, to } => self.rename(nodes, from, to),
        }
    }

    fn rename(&mut self, nodes: &NodeStore, from: &str, to: &str) -> Result<Applied> {
        let (from_parent, from_name) = split_non_root(from)?;
        let (to_parent, to_name) = split_non_root(to)?;
        if path::is_ancestor(from, to) {
            return Err(FsError::InvalidPath {
                path: to.to_string(),
                reason: "cannot move a path inside itself",
            });
        }
        let source = self
            .lookup(nodes, from)?
            .ok_or_else(|| FsError::NotFound(from.to_string()))?;
        let kind = source.kind();
        let committed = match source {
            NodeRef::Committed(entry) => Some((entry.id, nodes.get(&entry.id)?)),
            NodeRef::Mutable(_) => None,
        };
        self.check_creatable(nodes, to)?;
        let origin = self.move_origin(nodes, from)?;

        // Materialize both parents before detaching so nothing below can
        // fail half-way.
        self.node_mut(nodes, to_parent)?;
        let detached = self
            .node_mut(nodes, from_parent)?
            .entries_mut(from_parent)?
            .remove(from_name)
            .ok_or_else(|| FsError::NotFound(from.to_string()))?;
        let mut moved = match (detached, committed) {
            (TxnNode::Mutable(m), _) => m,
            (TxnNode::Committed(_), Some((id, node))) => {
                Box::new(MutableNode::from_committed(id, &node))
            }
            (TxnNode::Committed(entry), None) => {
                return Err(FsError::Corrupt(format!(
                    "node {} changed during rename",
                    entry.id
                )));
            }
        };
        moved.copy_from = origin.clone();
        self.node_mut(nodes, to_parent)?
            .entries_mut(to_parent)?
            .insert(to_name.to_string(), TxnNode::Mutable(moved));
        Ok(Applied {
            kind,
            copy_from: origin,
        })
    }

    /// Write the tree out as node-revisions of revision `rev`
    pub fn finalize(self, ctx: &mut Finalizer<'_>) -> Result<ObjectId> {
        Ok(ctx.finalize(self.root, "/")?.id)
    }
}

/// Commit-time writer for a staging tree
pub(crate) struct Finalizer<'a> {
    pub nodes: &'a NodeStore,
    pub conn: &'a Connection,
    pub rev: Revnum,
    /// Content that must be moved into the object store
    pub texts: Vec<TextRep>,
    /// Number of node-revisions written
    pub written: usize,
    /// Paths of mutable nodes that ended up identical to their predecessor
    pub folded: BTreeSet<String>,
}

impl<'a> Finalizer<'a> {
    pub fn new(nodes: &'a NodeStore, conn: &'a Connection, rev: Revnum) -> Self {
        Self {
            nodes,
            conn,
            rev,
            texts: Vec::new(),
            written: 0,
            folded: BTreeSet::new(),
        }
    }

    fn finalize(&mut self, node: TxnNode, p: &str) -> Result<DirEntry> {
        let m = match node {
            TxnNode::Committed(entry) => return Ok(entry),
            TxnNode::Mutable(m) => *m,
        };
        let kind = m.kind();
        let content = match m.content {
            MutableContent::File(text) => NodeContent::File(text),
            MutableContent::Directory(children) => {
                let mut dir = Directory::new();
                for (name, child) in children {
                    let entry = self.finalize(child, &path::join(p, &name))?;
                    dir.insert(name, entry)?;
                }
                NodeContent::Directory(dir)
            }
        };

        // A node that ended up identical to its predecessor is not a change
        if let (None, Some(pred_id)) = (&m.copy_from, m.predecessor) {
            let pred = self.nodes.get(&pred_id)?;
            if pred.content == content && pred.props == m.props && pred.created_path == p {
                self.folded.insert(p.to_string());
                return Ok(DirEntry { kind, id: pred_id });
            }
        }

        if let NodeContent::File(Some(rep)) = &content {
            self.texts.push(rep.clone());
        }
        let node_id = match m.node_id {
            Some(id) => id,
            None => db::conn_alloc_node_ids(self.conn, 1)?,
        };
        let node = NodeRevision {
            node_id,
            content,
            props: m.props,
            created_rev: self.rev,
            created_path: p.to_string(),
            predecessor: m.predecessor,
            copy_from: m.copy_from,
        };
        let id = self.nodes.put(self.conn, node)?;
        self.written += 1;
        Ok(DirEntry { kind, id })
    }
}

/// Net changes of a transaction, keyed by path
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeMap {
    entries: BTreeMap<String, ChangedPath>,
}

impl ChangeMap {
    pub fn record(&mut self, op: &TxnOp, applied: &Applied) {
        match op {
            TxnOp::Mkdir(p) | TxnOp::Mkfile(p) => self.add(p, applied.kind, None),
            TxnOp::Copy { to, .. } => self.add(to, applied.kind, applied.copy_from.clone()),
            TxnOp::SetText { path: p, .. } => self.modify(p, applied.kind, true, false),
            TxnOp::SetProp { path: p, .. } => self.modify(p, applied.kind, false, true),
            TxnOp::Delete(p) => self.delete(p, applied.kind),
            TxnOp::Rename { from, to } => {
                let moved: Vec<ChangedPath> = self
                    .entries
                    .values()
                    .filter(|c| c.path != *from && path::is_ancestor(from, &c.path))
                    .map(|c| ChangedPath {
                        path: path::rebase(&c.path, from, to),
                        ..c.clone()
                    })
                    .collect();
                self.delete(from, applied.kind);
                self.add(to, applied.kind, applied.copy_from.clone());
                for change in moved {
                    self.entries.insert(change.path.clone(), change);
                }
            }
        }
    }

    fn add(&mut self, p: &str, kind: NodeKind, copy_from: Option<CopyFrom>) {
        let action = match self.entries.get(p) {
            Some(c) if c.action == ChangeAction::Delete => ChangeAction::Replace,
            _ => ChangeAction::Add,
        };
        self.entries.insert(
            p.to_string(),
            ChangedPath {
                path: p.to_string(),
                action,
                kind,
                text_mod: false,
                prop_mod: false,
                copy_from,
            },
        );
    }

    fn modify(&mut self, p: &str, kind: NodeKind, text: bool, prop: bool) {
        let change = self
            .entries
            .entry(p.to_string())
            .or_insert_with(|| ChangedPath {
                path: p.to_string(),
                action: ChangeAction::Modify,
                kind,
                text_mod: false,
                prop_mod: false,
                copy_from: None,
            });
        change.text_mod |= text;
        change.prop_mod |= prop;
    }

    fn delete(&mut self, p: &str, kind: NodeKind) {
        self.entries
            .retain(|k, _| k.as_str() == p || !path::is_ancestor(p, k));
        let added_here = matches!(
            self.entries.remove(p),
            Some(ChangedPath {
                action: ChangeAction::Add,
                ..
            })
        );
        if !added_here {
            self.entries.insert(
                p.to_string(),
                ChangedPath {
                    path: p.to_string(),
                    action: ChangeAction::Delete,
                    kind,
                    text_mod: false,
                    prop_mod: false,
                    copy_from: None,
                },
            );
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ChangedPath> {
        self.entries.values().cloned().collect()
    }

    /// Changes left once modifications that folded back into their
    /// predecessor node-revision are dropped
    pub fn without_folded(&self, folded: &BTreeSet<String>) -> Vec<ChangedPath> {
        self.entries
            .values()
            .filter(|c| !(c.action == ChangeAction::Modify && folded.contains(&c.path)))
            .cloned()
            .collect()
    }
}
