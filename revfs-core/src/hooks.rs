//! Store hook scripts
//!
//! Supported hooks, looked up in `<store>/hooks/`:
//! - pre-commit: runs before a transaction becomes a revision (can reject)
//! - post-commit: runs after a revision is committed (notification)
//! - pre-revprop-change: runs before a revision property changes (can reject)
//! - post-revprop-change: runs after a revision property changed (notification)
//!
//! Hook scripts receive `KEY: value` lines on stdin and must exit with code 0
//! to succeed. For pre-hooks, a non-zero exit rejects the operation and
//! stderr (or stdout) becomes the error message.

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{FsError, Result};
use crate::object::{ChangedPath, Revnum};

/// Environment variable carrying the store root to hook scripts
pub const STORE_ENV: &str = "REVFS_STORE";

/// Runs hook scripts for one store
#[derive(Debug, Clone)]
pub struct HookManager {
    hooks_dir: PathBuf,
    enabled: bool,
}

impl HookManager {
    /// Hooks are expected in `<store_root>/hooks/`
    pub fn new(store_root: &Path, enabled: bool) -> Self {
        Self {
            hooks_dir: store_root.join("hooks"),
            enabled,
        }
    }

    pub fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir.join(name)
    }

    fn hook_exists(&self, name: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let p = self.hook_path(name);
        p.is_file().then_some(p)
    }

    /// Execute a hook script with `stdin_data` on its stdin.
    /// A missing hook allows the operation.
    fn run_hook(&self, name: &str, stdin_data: &str) -> Result<()> {
        let Some(hook_path) = self.hook_exists(name) else {
            return Ok(());
        };
        let rejected = |message: String| FsError::HookRejected {
            hook: name.to_string(),
            message,
        };

        let store_root = self.hooks_dir.parent().unwrap_or(Path::new("."));
        let mut child = Command::new(&hook_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(STORE_ENV, store_root)
            .spawn()
            .map_err(|e| rejected(format!("failed to execute: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that exits without reading stdin closes the pipe early.
            let _ = stdin.write_all(stdin_data.as_bytes());
        }

        let output = child
            .wait_with_output()
            .map_err(|e| rejected(format!("failed to wait: {}", e)))?;

        if output.status.success() {
            tracing::debug!(hook = name, "hook passed");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("exited with code {}", output.status.code().unwrap_or(-1))
        };
        Err(rejected(msg))
    }

    /// Run the pre-commit hook for a transaction about to be committed.
    pub fn run_pre_commit(
        &self,
        txn_id: &str,
        base_rev: Revnum,
        author: &str,
        log: &str,
        changes: &[ChangedPath],
    ) -> Result<()> {
        let mut data = String::new();
        let _ = writeln!(data, "TXN: {}", txn_id);
        let _ = writeln!(data, "BASE: {}", base_rev);
        let _ = writeln!(data, "AUTHOR: {}", author);
        let _ = writeln!(data, "LOG: {}", log);
        data.push_str("FILES:\n");
        for change in changes {
            let _ = writeln!(data, "{} {}", change.action.code(), change.path);
        }
        self.run_hook("pre-commit", &data)
    }

    /// Run the post-commit hook. The revision already exists, so failures
    /// are only logged.
    pub fn run_post_commit(&self, rev: Revnum, txn_id: &str, author: &str, date: &str) {
        let mut data = String::new();
        let _ = writeln!(data, "REVISION: {}", rev);
        let _ = writeln!(data, "TXN: {}", txn_id);
        let _ = writeln!(data, "AUTHOR: {}", author);
        let _ = writeln!(data, "DATE: {}", date);
        if let Err(e) = self.run_hook("post-commit", &data) {
            tracing::warn!(rev, "post-commit hook error (ignored): {}", e);
        }
    }

    /// Run the pre-revprop-change hook.
    ///
    /// `action` is one of "A", "M", "D"; `value` is empty for a delete.
    pub fn run_pre_revprop_change(
        &self,
        rev: Revnum,
        prop_name: &str,
        action: &str,
        value: &str,
    ) -> Result<()> {
        let mut data = String::new();
        let _ = writeln!(data, "REVISION: {}", rev);
        let _ = writeln!(data, "PROPNAME: {}", prop_name);
        let _ = writeln!(data, "ACTION: {}", action);
        let _ = writeln!(data, "VALUE: {}", value);
        self.run_hook("pre-revprop-change", &data)
    }

    pub fn run_post_revprop_change(&self, rev: Revnum, prop_name: &str, action: &str) {
        let mut data = String::new();
        let _ = writeln!(data, "REVISION: {}", rev);
        let _ = writeln!(data, "PROPNAME: {}", prop_name);
        let _ = writeln!(data, "ACTION: {}", action);
        if let Err(e) = self.run_hook("post-revprop-change", &data) {
            tracing::warn!(rev, "post-revprop-change hook error (ignored): {}", e);
        }
    }

    /// Create the hooks directory if missing
    pub fn ensure_hooks_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hooks_dir)?;
        Ok(())
    }
}
