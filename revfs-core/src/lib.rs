//! revfs Core Library
//!
//! A transactional, revisioned tree filesystem in the style of the
//! Subversion FS layer:
//! - Content-addressed node-revisions with copy-aware ancestry
//! - Immutable numbered revisions
//! - Writer-private transactions that commit atomically
//! - Copy-aware path history and revision log
//! - Node properties and journaled revision properties
//! - SQLite metadata (WAL mode) and zstd-compressed content objects

pub mod blob;
pub mod config;
mod db;
pub mod error;
pub mod history;
pub mod hooks;
mod node_store;
pub mod object;
pub mod path;
pub mod properties;
pub mod revision;
pub mod runtime;
mod staging;
pub mod store;
pub mod transaction;

pub use blob::{ContentChunks, FileContents};
pub use config::{
    CommitPolicy, Depth, HistoryOptions, ListOptions, LogOptions, StoreConfig, TxnOptions,
};
pub use error::{ErrorKind, FsError, Result};
pub use history::{History, HistoryCursor, HistoryEntry, Log, LogEntry};
pub use hooks::HookManager;
pub use object::{
    ChangeAction, ChangedPath, CopyFrom, NodeId, NodeKind, NodeRevision, ObjectId, Revnum,
};
pub use properties::{PropertySet, RevpropChange, svn_props};
pub use revision::{DirEntries, DirListEntry, RevisionRoot};
pub use runtime::initialize_runtime;
pub use store::{Store, VerifyReport, create_store, delete_store, open_store};
pub use transaction::{TextWriter, Transaction, TxnState};
