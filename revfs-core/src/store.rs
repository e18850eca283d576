//! Store handle: creation, opening and the read/write entry points
//!
//! On-disk layout:
//!
//! ```text
//! <root>/
//!   format            store format number
//!   uuid              store UUID
//!   config.json       StoreConfig
//!   revfs.sqlite      metadata database (WAL)
//!   objects/xx/yyyy   zstd-compressed content objects
//!   txns/<txn-id>/    staging files of open transactions
//!   hooks/            hook scripts
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blob::{BlobStore, FileContents};
use crate::config::{HistoryOptions, ListOptions, LogOptions, StoreConfig, TxnOptions};
use crate::db::{self, Db};
use crate::error::{FsError, Result};
use crate::history::{History, HistoryCursor, Log};
use crate::hooks::HookManager;
use crate::node_store::NodeStore;
use crate::object::{
    ChangedPath, Directory, NodeContent, NodeKind, NodeRevision, ObjectId, Revnum,
};
use crate::properties::{PropertySet, RevpropChange, svn_date_now, svn_props};
use crate::revision::{DirEntries, RevisionRoot};
use crate::runtime::initialize_runtime;
use crate::transaction::Transaction;

/// Current on-disk format
pub const FORMAT: u32 = 1;

const FORMAT_FILE: &str = "format";
const UUID_FILE: &str = "uuid";
const OBJECTS_DIR: &str = "objects";
const TXNS_DIR: &str = "txns";

/// State shared by every handle, transaction and reader of one store
pub(crate) struct StoreInner {
    pub root: PathBuf,
    pub uuid: String,
    pub config: StoreConfig,
    pub db: Arc<Db>,
    pub nodes: NodeStore,
    pub blobs: Arc<BlobStore>,
    pub hooks: HookManager,
    /// Ids of transactions open in this process
    pub active_txns: Mutex<HashSet<String>>,
}

impl StoreInner {
    fn open(root: &Path) -> Result<Self> {
        let format_path = root.join(FORMAT_FILE);
        if !format_path.is_file() {
            return Err(FsError::NoStore(root.to_path_buf()));
        }
        let format: u32 = fs::read_to_string(&format_path)?
            .trim()
            .parse()
            .map_err(|_| FsError::Corrupt("unreadable format file".into()))?;
        if format != FORMAT {
            return Err(FsError::Corrupt(format!("unsupported store format {}", format)));
        }
        let uuid = fs::read_to_string(root.join(UUID_FILE))?.trim().to_string();
        let config = StoreConfig::load(root)?;
        let db = Arc::new(Db::open(root)?);
        let nodes = NodeStore::new(Arc::clone(&db), config.node_cache_capacity);
        let blobs = Arc::new(BlobStore::open(
            root.join(OBJECTS_DIR),
            config.compression_level,
            config.fsync_objects,
        )?);
        let hooks = HookManager::new(root, config.hooks_enabled);
        Ok(Self {
            root: root.to_path_buf(),
            uuid,
            config,
            db,
            nodes,
            blobs,
            hooks,
            active_txns: Mutex::new(HashSet::new()),
        })
    }

    pub fn youngest(&self) -> Result<Revnum> {
        let conn = self.db.read();
        db::conn_youngest(&conn)
    }

    /// Root node-revision of `rev`, or `NoSuchRevision`
    pub fn revision_root_id(&self, rev: Revnum) -> Result<ObjectId> {
        let conn = self.db.read();
        db::conn_revision_root(&conn, rev)?.ok_or(FsError::NoSuchRevision(rev))
    }

    pub fn txns_dir(&self) -> PathBuf {
        self.root.join(TXNS_DIR)
    }
}

/// Summary produced by [`Store::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub revisions: u64,
    pub nodes: u64,
    pub contents: u64,
}

/// Handle to an open store
///
/// Cheap to clone; all handles for one directory share a single instance.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("uuid", &self.inner.uuid)
            .finish()
    }
}

/// Create a store with the default configuration
pub fn create_store(path: impl AsRef<Path>) -> Result<Store> {
    Store::create(path, StoreConfig::default())
}

pub fn open_store(path: impl AsRef<Path>) -> Result<Store> {
    Store::open(path)
}

pub fn delete_store(path: impl AsRef<Path>) -> Result<()> {
    Store::delete(path)
}

fn canonical_root(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NoStore(path.to_path_buf()),
        _ => FsError::Io(e),
    })
}

impl Store {
    /// Create a new store at `path` holding the empty revision 0
    ///
    /// `path` must not exist or be an empty directory. On failure nothing
    /// is left behind.
    pub fn create(path: impl AsRef<Path>, config: StoreConfig) -> Result<Store> {
        Self::create_with(path.as_ref(), config, Self::init_layout)
    }

    fn create_with(
        path: &Path,
        config: StoreConfig,
        init: impl FnOnce(&Path, &StoreConfig) -> Result<()>,
    ) -> Result<Store> {
        initialize_runtime();
        let existed = path.exists();
        if existed && fs::read_dir(path)?.next().is_some() {
            return Err(FsError::StoreExists(path.to_path_buf()));
        }
        fs::create_dir_all(path)?;

        if let Err(e) = init(path, &config) {
            let cleanup = if existed {
                fs::read_dir(path).and_then(|entries| {
                    for entry in entries {
                        let entry = entry?;
                        if entry.file_type()?.is_dir() {
                            fs::remove_dir_all(entry.path())?;
                        } else {
                            fs::remove_file(entry.path())?;
                        }
                    }
                    Ok(())
                })
            } else {
                fs::remove_dir_all(path)
            };
            if let Err(ce) = cleanup {
                tracing::warn!("failed to clean up partial store at {:?}: {}", path, ce);
            }
            return Err(e);
        }

        let store = Self::open(path)?;
        tracing::info!(path = ?store.path(), uuid = %store.uuid(), "created store");
        Ok(store)
    }

    fn init_layout(root: &Path, config: &StoreConfig) -> Result<()> {
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(TXNS_DIR))?;
        HookManager::new(root, config.hooks_enabled).ensure_hooks_dir()?;
        fs::write(root.join(UUID_FILE), uuid::Uuid::new_v4().to_string())?;
        config.save(root)?;

        let db = Db::create(root)?;
        {
            let mut conn = db.write();
            let tx = conn.transaction()?;
            let empty_root = NodeRevision {
                node_id: 0,
                content: NodeContent::Directory(Directory::new()),
                props: PropertySet::new(),
                created_rev: 0,
                created_path: "/".to_string(),
                predecessor: None,
                copy_from: None,
            };
            let data = empty_root.to_bytes()?;
            let id = ObjectId::from_data(&data);
            db::conn_put_node(&tx, &id, &data)?;
            db::conn_insert_revision(&tx, 0, &id, "0")?;
            db::conn_insert_revprop(&tx, 0, svn_props::DATE, &svn_date_now())?;
            tx.commit()?;
        }
        // Written last: a directory without it is not a store
        fs::write(root.join(FORMAT_FILE), format!("{}\n", FORMAT))?;
        Ok(())
    }

    /// Open an existing store; repeated opens share one instance
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let runtime = initialize_runtime();
        let root = canonical_root(path.as_ref())?;
        let inner = runtime.open_or_share(&root, || {
            let inner = StoreInner::open(&root)?;
            tracing::debug!(path = ?root, "opened store");
            Ok(Arc::new(inner))
        })?;
        Ok(Store { inner })
    }

    /// Remove a store from disk. Fails while it is open in this process.
    pub fn delete(path: impl AsRef<Path>) -> Result<()> {
        let runtime = initialize_runtime();
        let root = canonical_root(path.as_ref())?;
        if !root.join(FORMAT_FILE).is_file() {
            return Err(FsError::NoStore(root));
        }
        if runtime.is_open(&root) {
            return Err(FsError::StoreInUse(root));
        }
        fs::remove_dir_all(&root)?;
        tracing::info!(path = ?root, "deleted store");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn youngest_rev(&self) -> Result<Revnum> {
        self.inner.youngest()
    }

    /// Snapshot of revision `rev`
    pub fn revision_root(&self, rev: Revnum) -> Result<RevisionRoot> {
        RevisionRoot::open(Arc::clone(&self.inner), rev)
    }

    /// Start a transaction (on the youngest revision unless
    /// `options.base_rev` says otherwise)
    pub fn begin_txn(&self, options: TxnOptions) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner), options)
    }

    pub fn read_content(&self, path: &str, rev: Revnum) -> Result<FileContents> {
        self.revision_root(rev)?.read_content(path)
    }

    pub fn list_dir(&self, path: &str, rev: Revnum) -> Result<DirEntries> {
        self.revision_root(rev)?.list_dir(path)
    }

    pub fn list_dir_with(&self, path: &str, rev: Revnum, options: ListOptions) -> Result<DirEntries> {
        self.revision_root(rev)?.list_dir_with(path, options)
    }

    pub fn check_path(&self, path: &str, rev: Revnum) -> Result<Option<NodeKind>> {
        self.revision_root(rev)?.check_path(path)
    }

    pub fn is_file(&self, path: &str, rev: Revnum) -> Result<bool> {
        self.revision_root(rev)?.is_file(path)
    }

    pub fn is_dir(&self, path: &str, rev: Revnum) -> Result<bool> {
        self.revision_root(rev)?.is_dir(path)
    }

    pub fn node_created_rev(&self, path: &str, rev: Revnum) -> Result<Revnum> {
        self.revision_root(rev)?.node_created_rev(path)
    }

    pub fn file_length(&self, path: &str, rev: Revnum) -> Result<u64> {
        self.revision_root(rev)?.file_length(path)
    }

    pub fn file_checksum(&self, path: &str, rev: Revnum) -> Result<String> {
        self.revision_root(rev)?.file_checksum(path)
    }

    /// Newest-first history of `path` starting at `rev`
    pub fn history(&self, path: &str, rev: Revnum, options: HistoryOptions) -> Result<History> {
        History::start(
            Arc::clone(&self.inner),
            path,
            rev,
            options.limit,
            options.cross_copies,
        )
    }

    /// Continue a history walk from a saved cursor
    pub fn resume_history(&self, cursor: HistoryCursor) -> History {
        History::resume(Arc::clone(&self.inner), cursor)
    }

    /// Newest-first log of the revisions that changed `options.path`
    pub fn log(&self, options: LogOptions) -> Result<Log> {
        let start = match options.start {
            Some(rev) => rev,
            None => self.youngest_rev()?,
        };
        let (newest, oldest) = if start >= options.end {
            (start, options.end)
        } else {
            (options.end, start)
        };
        let history = History::start(
            Arc::clone(&self.inner),
            &options.path,
            newest,
            None,
            !options.strict_node_history,
        )?;
        Ok(Log::new(
            Arc::clone(&self.inner),
            history,
            oldest,
            options.discover_changed_paths,
            options.limit,
        ))
    }

    pub fn get_node_props(&self, path: &str, rev: Revnum) -> Result<PropertySet> {
        self.revision_root(rev)?.node_props(path)
    }

    pub fn get_node_prop(&self, path: &str, rev: Revnum, name: &str) -> Result<Option<String>> {
        self.revision_root(rev)?.node_prop(path, name)
    }

    fn ensure_revision(&self, rev: Revnum) -> Result<()> {
        self.inner.revision_root_id(rev).map(|_| ())
    }

    pub fn get_revision_props(&self, rev: Revnum) -> Result<PropertySet> {
        self.ensure_revision(rev)?;
        let conn = self.inner.db.read();
        db::conn_revprops(&conn, rev)
    }

    pub fn get_revision_prop(&self, rev: Revnum, name: &str) -> Result<Option<String>> {
        self.ensure_revision(rev)?;
        let conn = self.inner.db.read();
        db::conn_revprop(&conn, rev, name)
    }

    /// Change a revision property after the fact; `None` deletes it
    pub fn set_revision_prop(&self, rev: Revnum, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_revision(rev)?;
        let old = self.get_revision_prop(rev, name)?;
        let action = match (&old, value) {
            (None, _) => "A",
            (Some(_), Some(_)) => "M",
            (Some(_), None) => "D",
        };
        self.inner
            .hooks
            .run_pre_revprop_change(rev, name, action, value.unwrap_or(""))?;

        let change = {
            let mut conn = self.inner.db.write();
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let change = db::conn_set_revprop(&tx, rev, name, value, &svn_date_now())?;
            tx.commit()?;
            change
        };
        tracing::info!(rev, prop = name, seq = change.seq, "revision property changed");
        self.inner.hooks.run_post_revprop_change(rev, name, change.action());
        Ok(())
    }

    /// Journal of revision-property changes, oldest first
    pub fn revision_prop_journal(&self, rev: Option<Revnum>) -> Result<Vec<RevpropChange>> {
        let conn = self.inner.db.read();
        db::conn_revprop_journal(&conn, rev)
    }

    pub fn paths_changed(&self, rev: Revnum) -> Result<Vec<ChangedPath>> {
        self.revision_root(rev)?.paths_changed()
    }

    /// Check every revision: each reachable node-revision must exist, hash
    /// to its id and not postdate the revision, and each content object must
    /// match its hash. Stops at the first problem.
    pub fn verify(&self) -> Result<VerifyReport> {
        let youngest = self.youngest_rev()?;
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut contents: HashSet<ObjectId> = HashSet::new();
        let mut report = VerifyReport::default();

        for rev in 0..=youngest {
            let root = self.inner.revision_root_id(rev)?;
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let node = self.inner.nodes.get(&id)?;
                if node.id()? != id {
                    return Err(FsError::Corrupt(format!("node-revision {} does not match its id", id)));
                }
                if node.created_rev > rev {
                    return Err(FsError::Corrupt(format!(
                        "node-revision {} of r{} is referenced by r{}",
                        id, node.created_rev, rev
                    )));
                }
                match &node.content {
                    NodeContent::Directory(dir) => stack.extend(dir.iter().map(|(_, e)| e.id)),
                    NodeContent::File(Some(rep)) => {
                        if contents.insert(rep.blob) {
                            self.inner.blobs.verify(rep)?;
                        }
                    }
                    NodeContent::File(None) => {}
                }
                report.nodes += 1;
            }
            report.revisions += 1;
            tracing::debug!(rev, "verified revision");
        }
        report.contents = contents.len() as u64;
        tracing::info!(
            revisions = report.revisions,
            nodes = report.nodes,
            contents = report.contents,
            "store verified"
        );
        Ok(report)
    }

    /// Ids of transactions that have a staging directory, including ones
    /// left behind by crashed processes
    pub fn list_transactions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.inner.txns_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a dead transaction's staging directory
    pub fn purge_transaction(&self, id: &str) -> Result<()> {
        if self.inner.active_txns.lock().contains(id) {
            return Err(FsError::InvalidState {
                txn: id.to_string(),
                state: "open",
            });
        }
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(FsError::NotFound(id.to_string()));
        }
        let dir = self.inner.txns_dir().join(id);
        if !dir.is_dir() {
            return Err(FsError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        tracing::info!(txn = id, "purged transaction");
        Ok(())
    }

    /// Node-revision by id, or `NoSuchNode`
    pub fn node(&self, id: &ObjectId) -> Result<Arc<NodeRevision>> {
        self.inner.nodes.get(id)
    }

    /// Node-revisions currently cached in memory
    pub fn cached_nodes(&self) -> usize {
        self.inner.nodes.cached()
    }

    pub fn node_count(&self) -> Result<u64> {
        let conn = self.inner.db.read();
        db::conn_node_count(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_create_and_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repo");
        let store = create_store(&path).unwrap();
        assert_eq!(store.youngest_rev().unwrap(), 0);
        assert_eq!(store.uuid().len(), 36);
        assert!(store.is_dir("/", 0).unwrap());
        assert_eq!(store.list_dir("/", 0).unwrap().count(), 0);
        assert!(store.get_revision_prop(0, svn_props::DATE).unwrap().is_some());

        let again = open_store(&path).unwrap();
        assert!(Arc::ptr_eq(&store.inner, &again.inner));
    }

    #[test]
    fn test_create_refuses_non_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("junk"), b"x").unwrap();
        let err = create_store(tmp.path()).unwrap_err();
        assert!(matches!(err, FsError::StoreExists(_)));
        assert!(tmp.path().join("junk").exists());
    }

    fn failing_init(root: &Path, config: &StoreConfig) -> Result<()> {
        Store::init_layout(root, config)?;
        Err(FsError::Io(std::io::Error::other("disk full")))
    }

    #[test]
    fn test_failed_create_removes_new_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("repo");
        let err = Store::create_with(&path, StoreConfig::default(), failing_init).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(!path.exists());
        assert!(matches!(open_store(&path), Err(FsError::NoStore(_))));
    }

    #[test]
    fn test_failed_create_empties_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repo");
        fs::create_dir(&path).unwrap();
        let err = Store::create_with(&path, StoreConfig::default(), failing_init).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(path.is_dir());
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);

        // The emptied directory takes a new store
        let store = create_store(&path).unwrap();
        assert_eq!(store.youngest_rev().unwrap(), 0);
    }

    #[test]
    fn test_node_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = create_store(tmp.path().join("repo")).unwrap();
        let root_id = store.revision_root(0).unwrap().root_id();
        let root = store.node(&root_id).unwrap();
        assert_eq!(root.node_id, 0);
        assert_eq!(root.created_path, "/");

        let missing = ObjectId::from_data(b"no such node");
        let err = store.node(&missing).unwrap_err();
        assert!(matches!(err, FsError::NoSuchNode(id) if id == missing));
        assert!(store.node(&missing).unwrap_err().is(ErrorKind::NotFound));
    }

    #[test]
    fn test_open_missing_store() {
        let tmp = tempfile::tempdir().unwrap();
        let err = open_store(tmp.path().join("nothing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = open_store(tmp.path()).unwrap_err();
        assert!(matches!(err, FsError::NoStore(_)));
    }

    #[test]
    fn test_delete_store() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repo");
        let store = create_store(&path).unwrap();
        let err = delete_store(&path).unwrap_err();
        assert!(matches!(err, FsError::StoreInUse(_)));
        drop(store);
        delete_store(&path).unwrap();
        assert!(!path.exists());
        assert!(matches!(delete_store(&path), Err(FsError::NoStore(_))));
    }

    #[test]
    fn test_config_is_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repo");
        let config = StoreConfig::default()
            .with_commit_policy(crate::config::CommitPolicy::PathBased)
            .with_hooks(false);
        drop(Store::create(&path, config.clone()).unwrap());
        let store = open_store(&path).unwrap();
        assert_eq!(store.config(), &config);
    }

    #[test]
    fn test_unknown_revision() {
        let tmp = tempfile::tempdir().unwrap();
        let store = create_store(tmp.path().join("repo")).unwrap();
        assert!(matches!(store.revision_root(5), Err(FsError::NoSuchRevision(5))));
        assert!(matches!(store.get_revision_props(5), Err(FsError::NoSuchRevision(5))));
        assert!(matches!(
            store.begin_txn(TxnOptions::at(3)),
            Err(FsError::NoSuchRevision(3))
        ));
    }

    #[test]
    fn test_purge_transaction() {
        let tmp = tempfile::tempdir().unwrap();
        let store = create_store(tmp.path().join("repo")).unwrap();
        let txn = store.begin_txn(TxnOptions::default()).unwrap();
        let id = txn.id().to_string();
        assert_eq!(store.list_transactions().unwrap(), vec![id.clone()]);
        assert!(matches!(
            store.purge_transaction(&id),
            Err(FsError::InvalidState { .. })
        ));

        // Simulate a transaction abandoned by a crashed process
        fs::create_dir_all(store.inner.txns_dir().join("7-dead")).unwrap();
        store.purge_transaction("7-dead").unwrap();
        assert!(matches!(store.purge_transaction("7-dead"), Err(FsError::NotFound(_))));
        assert!(matches!(store.purge_transaction("../x"), Err(FsError::NotFound(_))));

        drop(txn);
        assert!(store.list_transactions().unwrap().is_empty());
    }
}
