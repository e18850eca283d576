//! Store configuration and per-operation options

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::object::Revnum;

/// Name of the configuration file inside a store
pub const CONFIG_FILE: &str = "config.json";

/// How `commit` decides whether a transaction is out of date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitPolicy {
    /// The transaction's base revision must still be the youngest revision
    #[default]
    Strict,
    /// Revisions committed after the base may not touch any path the
    /// transaction touched; otherwise the changes are replayed on top of
    /// the youngest revision
    PathBased,
}

/// Store-wide configuration, persisted as `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Out-of-date check used by every commit in this store
    pub commit_policy: CommitPolicy,
    /// zstd level for content objects
    pub compression_level: i32,
    /// Chunk size for streamed content reads (bytes)
    pub read_chunk_size: usize,
    /// Number of node-revisions kept in the in-memory cache
    pub node_cache_capacity: usize,
    /// fsync content objects before they become visible
    pub fsync_objects: bool,
    /// Run scripts from the `hooks/` directory
    pub hooks_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            commit_policy: CommitPolicy::Strict,
            compression_level: 3,
            read_chunk_size: 64 * 1024,
            node_cache_capacity: 4096,
            fsync_objects: false,
            hooks_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Load from a store root; a missing file yields the defaults
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write to a store root
    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(root.join(CONFIG_FILE), data)?;
        Ok(())
    }

    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    pub fn with_hooks(mut self, enabled: bool) -> Self {
        self.hooks_enabled = enabled;
        self
    }
}

/// Options for `Store::begin_txn`
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Base revision; the youngest revision when `None`
    pub base_rev: Option<Revnum>,
    /// Becomes `svn:author` on commit
    pub author: Option<String>,
    /// Becomes `svn:log` on commit
    pub log_message: Option<String>,
}

impl TxnOptions {
    pub fn at(rev: Revnum) -> Self {
        Self {
            base_rev: Some(rev),
            ..Self::default()
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }
}

/// Options for `Store::history`
#[derive(Debug, Clone, Copy)]
pub struct HistoryOptions {
    /// Maximum number of entries to produce
    pub limit: Option<usize>,
    /// Continue into the source of a copy instead of stopping there
    pub cross_copies: bool,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            limit: None,
            cross_copies: true,
        }
    }
}

/// Options for `Store::log`
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub path: String,
    /// Newest revision to report; the youngest revision when `None`
    pub start: Option<Revnum>,
    /// Oldest revision to report
    pub end: Revnum,
    pub limit: Option<usize>,
    /// Attach the changed-path list to every entry
    pub discover_changed_paths: bool,
    /// Stop at copies instead of following them
    pub strict_node_history: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            start: None,
            end: 0,
            limit: None,
            discover_changed_paths: false,
            strict_node_history: false,
        }
    }
}

/// Recursion depth for directory listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Depth {
    /// The directory's own entries
    #[default]
    Immediates,
    /// Every descendant
    Infinity,
}

/// Options for `Store::list_dir_with`
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub depth: Depth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::default()
            .with_commit_policy(CommitPolicy::PathBased)
            .with_hooks(false);
        cfg.save(tmp.path()).unwrap();
        let loaded = StoreConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), r#"{"commit_policy":"path-based"}"#).unwrap();
        let loaded = StoreConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.commit_policy, CommitPolicy::PathBased);
        assert_eq!(loaded.read_chunk_size, StoreConfig::default().read_chunk_size);
    }

    #[test]
    fn test_missing_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(StoreConfig::load(tmp.path()).unwrap(), StoreConfig::default());
    }
}
