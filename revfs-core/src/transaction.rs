//! Transactions: staged changes that commit atomically into a new revision

use rusqlite::TransactionBehavior;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::blob::BlobWriter;
use crate::config::{CommitPolicy, TxnOptions};
use crate::db;
use crate::error::{ErrorKind, FsError, Result};
use crate::object::{ChangedPath, CopyFrom, NodeKind, Revnum};
use crate::path;
use crate::properties::{PropertySet, svn_date_now, svn_props};
use crate::revision::resolve;
use crate::staging::{ChangeMap, Finalizer, StagingTree, TxnOp};
use crate::store::StoreInner;

/// State of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting mutations
    Open,
    /// Became the given revision
    Committed(Revnum),
    /// Discarded
    Aborted,
}

impl TxnState {
    fn name(&self) -> &'static str {
        match self {
            TxnState::Open => "open",
            TxnState::Committed(_) => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

/// A writer-private staging area based on one revision
///
/// Dropping an open transaction aborts it.
pub struct Transaction {
    inner: Arc<StoreInner>,
    id: String,
    base_rev: Revnum,
    state: TxnState,
    tree: StagingTree,
    ops: Vec<TxnOp>,
    changes: ChangeMap,
    props: PropertySet,
    dir: PathBuf,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("base_rev", &self.base_rev)
            .field("state", &self.state)
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn begin(inner: Arc<StoreInner>, options: TxnOptions) -> Result<Self> {
        let base_rev = match options.base_rev {
            Some(rev) => rev,
            None => inner.youngest()?,
        };
        let root = inner.revision_root_id(base_rev)?;
        let id = format!("{}-{}", base_rev, uuid::Uuid::new_v4().simple());
        let dir = inner.txns_dir().join(&id);
        fs::create_dir_all(&dir)?;
        inner.active_txns.lock().insert(id.clone());

        let mut props = PropertySet::new();
        if let Some(author) = options.author {
            props.set(svn_props::AUTHOR.to_string(), author);
        }
        if let Some(message) = options.log_message {
            props.set(svn_props::LOG.to_string(), message);
        }

        tracing::debug!(txn = %id, base_rev, "transaction opened");
        Ok(Self {
            inner,
            id,
            base_rev,
            state: TxnState::Open,
            tree: StagingTree::new(root, base_rev),
            ops: Vec::new(),
            changes: ChangeMap::default(),
            props,
            dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_rev(&self) -> Revnum {
        self.base_rev
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxnState::Open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FsError::InvalidState {
                txn: self.id.clone(),
                state: self.state.name(),
            })
        }
    }

    fn stage(&mut self, op: TxnOp) -> Result<()> {
        self.ensure_open()?;
        let applied = self.tree.apply(&self.inner.nodes, &op)?;
        self.changes.record(&op, &applied);
        self.ops.push(op);
        Ok(())
    }

    /// Kind of the node at `path` in the transaction's current tree
    pub fn check_path(&self, path: &str) -> Result<Option<NodeKind>> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        self.tree.kind_at(&self.inner.nodes, &path)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.ensure_open()?;
        self.stage(TxnOp::Mkdir(path::canonicalize(path)?))
    }

    /// Create an empty file
    pub fn mkfile(&mut self, path: &str) -> Result<()> {
        self.ensure_open()?;
        self.stage(TxnOp::Mkfile(path::canonicalize(path)?))
    }

    /// Remove a file or a whole directory subtree
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.ensure_open()?;
        self.stage(TxnOp::Delete(path::canonicalize(path)?))
    }

    /// Set (`Some`) or remove (`None`) a node property
    pub fn set_node_prop(&mut self, path: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        self.stage(TxnOp::SetProp {
            path: path::canonicalize(path)?,
            name: name.to_string(),
            value: value.map(str::to_string),
        })
    }

    /// Copy `from_path` as it was in `from_rev` to `to_path`
    pub fn copy(&mut self, from_path: &str, from_rev: Revnum, to_path: &str) -> Result<()> {
        self.ensure_open()?;
        let from_path = path::canonicalize(from_path)?;
        let to = path::canonicalize(to_path)?;
        let root = self.inner.revision_root_id(from_rev)?;
        let source = resolve(&self.inner, root, &from_path)?
            .ok_or_else(|| FsError::NotFound(from_path.clone()))?;
        self.stage(TxnOp::Copy {
            from: CopyFrom {
                path: from_path,
                rev: from_rev,
            },
            source,
            to,
        })
    }

    /// Move a node, keeping changes already staged below it
    pub fn rename(&mut self, from_path: &str, to_path: &str) -> Result<()> {
        self.ensure_open()?;
        self.stage(TxnOp::Rename {
            from: path::canonicalize(from_path)?,
            to: path::canonicalize(to_path)?,
        })
    }

    /// Open a write stream that replaces the content of the file at `path`
    /// when closed. `expected_sha1` (hex) is checked on close.
    pub fn apply_text(&mut self, path: &str, expected_sha1: Option<&str>) -> Result<TextWriter<'_>> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        match self.tree.kind_at(&self.inner.nodes, &path)? {
            Some(NodeKind::File) => {}
            Some(NodeKind::Directory) => return Err(FsError::NotAFile(path)),
            None => return Err(FsError::NotFound(path)),
        }
        let writer = self.inner.blobs.writer(&self.dir)?;
        Ok(TextWriter {
            txn: self,
            path,
            expected_sha1: expected_sha1.map(str::to_string),
            writer,
        })
    }

    /// Replace a file's content with `data`
    pub fn set_contents(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.apply_text(path, None)?;
        writer.write_all(data)?;
        writer.close()
    }

    /// Set a property that becomes a revision property on commit
    pub fn set_txn_prop(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        self.props.apply(name, value.map(str::to_string));
        Ok(())
    }

    pub fn txn_props(&self) -> &PropertySet {
        &self.props
    }

    /// Net changes staged so far
    pub fn changes(&self) -> Vec<ChangedPath> {
        self.changes.to_vec()
    }

    /// Commit into a new revision
    ///
    /// Staged content moves into the object store before the write lock is
    /// taken. On `OutOfDate` (and any other failure) the transaction stays
    /// open and no revision is added; moved content is simply unreferenced.
    pub fn commit(&mut self) -> Result<Revnum> {
        self.ensure_open()?;
        if self.changes.is_empty() {
            tracing::debug!(txn = %self.id, "committing a transaction without changes");
        }
        let staged_changes = self.changes.to_vec();
        let author = self.props.get(svn_props::AUTHOR).cloned().unwrap_or_default();
        let log = self.props.get(svn_props::LOG).cloned().unwrap_or_default();
        self.inner
            .hooks
            .run_pre_commit(&self.id, self.base_rev, &author, &log, &staged_changes)?;

        let inner = Arc::clone(&self.inner);
        self.import_staged_content()?;

        let mut conn = inner.db.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let youngest = db::conn_youngest(&tx)?;
        let tree = if youngest == self.base_rev {
            self.tree.clone()
        } else {
            match inner.config.commit_policy {
                CommitPolicy::Strict => {
                    return Err(FsError::OutOfDate(format!(
                        "transaction {} is based on r{} but the youngest revision is r{}",
                        self.id, self.base_rev, youngest
                    )));
                }
                CommitPolicy::PathBased => {
                    // Replay revisits every path an operation touched, not
                    // only the ones left in the net change list
                    let touched: Vec<&str> = self
                        .changes
                        .paths()
                        .chain(self.ops.iter().flat_map(TxnOp::paths))
                        .collect();
                    for (rev, changed) in db::conn_changed_paths_after(&tx, self.base_rev)? {
                        if let Some(p) = touched.iter().find(|p| path::overlaps(p, &changed)) {
                            return Err(FsError::OutOfDate(format!(
                                "'{}' conflicts with '{}' changed in r{}",
                                p, changed, rev
                            )));
                        }
                    }
                    let root = db::conn_revision_root(&tx, youngest)?
                        .ok_or(FsError::NoSuchRevision(youngest))?;
                    tracing::debug!(txn = %self.id, base = self.base_rev, youngest, "replaying transaction");
                    StagingTree::replay(root, youngest, &inner.nodes, &self.ops).map_err(|e| {
                        if matches!(
                            e.kind(),
                            ErrorKind::NotFound | ErrorKind::AlreadyExists | ErrorKind::NoSuchParent
                        ) {
                            FsError::OutOfDate(format!(
                                "transaction {} no longer applies to r{}: {}",
                                self.id, youngest, e
                            ))
                        } else {
                            e
                        }
                    })?
                }
            }
        };

        let new_rev = youngest + 1;
        let mut fin = Finalizer::new(&inner.nodes, &tx, new_rev);
        let root = tree.finalize(&mut fin)?;
        if let Some(rep) = fin.texts.iter().find(|rep| !inner.blobs.contains(&rep.blob)) {
            return Err(FsError::Corrupt(format!(
                "content {} of transaction {} is not in the object store",
                rep.blob, self.id
            )));
        }
        let written = fin.written;
        let changes = self.changes.without_folded(&fin.folded);

        db::conn_insert_revision(&tx, new_rev, &root, &self.id)?;
        let date = svn_date_now();
        for (name, value) in self.props.iter() {
            db::conn_insert_revprop(&tx, new_rev, name, value)?;
        }
        db::conn_insert_revprop(&tx, new_rev, svn_props::DATE, &date)?;
        for change in &changes {
            db::conn_insert_change(&tx, new_rev, change)?;
        }
        tx.commit()?;
        drop(conn);

        self.state = TxnState::Committed(new_rev);
        self.release();
        tracing::info!(
            rev = new_rev,
            txn = %self.id,
            nodes = written,
            changes = changes.len(),
            "committed revision"
        );
        inner.hooks.run_post_commit(new_rev, &self.id, &author, &date);
        Ok(new_rev)
    }

    /// Discard the transaction. Always succeeds; a no-op once terminal.
    pub fn abort(&mut self) -> Result<()> {
        if self.state == TxnState::Open {
            self.state = TxnState::Aborted;
            self.release();
            tracing::debug!(txn = %self.id, "transaction aborted");
        }
        Ok(())
    }

    fn import_staged_content(&self) -> Result<()> {
        for op in &self.ops {
            let TxnOp::SetText { rep: Some(rep), .. } = op else {
                continue;
            };
            if self.inner.blobs.contains(&rep.blob) {
                continue;
            }
            let staged = self.dir.join(rep.blob.to_hex());
            if !staged.exists() {
                return Err(FsError::Corrupt(format!(
                    "staged content {} of transaction {} is missing",
                    rep.blob, self.id
                )));
            }
            self.inner.blobs.import(&staged, &rep.blob)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.inner.active_txns.lock().remove(&self.id);
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(txn = %self.id, "failed to remove staging directory: {}", e);
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let _ = self.abort();
    }
}

/// Write stream returned by [`Transaction::apply_text`]
///
/// The file's content is only replaced by a successful [`close`]; dropping
/// the writer discards what was written.
///
/// [`close`]: TextWriter::close
pub struct TextWriter<'t> {
    txn: &'t mut Transaction,
    path: String,
    expected_sha1: Option<String>,
    writer: BlobWriter,
}

impl TextWriter<'_> {
    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    /// Finish the write and replace the file's content
    pub fn close(self) -> Result<()> {
        let TextWriter {
            txn,
            path,
            expected_sha1,
            writer,
        } = self;
        let (rep, _staged) = writer.finish()?;
        if let Some(expected) = expected_sha1 {
            if !expected.eq_ignore_ascii_case(&rep.sha1) {
                return Err(FsError::CommitPrecondition(format!(
                    "checksum mismatch for '{}': expected {}, actual {}",
                    path, expected, rep.sha1
                )));
            }
        }
        txn.stage(TxnOp::SetText {
            path,
            rep: Some(rep),
        })
    }
}

impl Write for TextWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
