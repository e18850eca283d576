//! Subcommand implementations
//!
//! Every command writes its report to `out` so tests can capture it.

use anyhow::{Context, Result, bail};
use revfs_core::{
    CommitPolicy, Depth, HistoryOptions, ListOptions, LogOptions, NodeKind, Store, StoreConfig,
};
use std::io::Write;
use std::path::Path;

use crate::{Commands, PolicyArg};

pub(crate) fn run(command: Commands, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Create {
            path,
            policy,
            no_hooks,
        } => create(&path, policy, no_hooks, out),
        Commands::Delete { path } => {
            Store::delete(&path).with_context(|| format!("deleting {}", path.display()))?;
            writeln!(out, "Deleted store at {}", path.display())?;
            Ok(())
        }
        Commands::Info { path } => info(&open(&path)?, out),
        Commands::Verify { path, quiet } => verify(&open(&path)?, quiet, out),
        Commands::Log {
            path,
            node,
            start,
            end,
            limit,
            verbose,
            stop_on_copy,
        } => log(
            &open(&path)?,
            LogOptions {
                path: node,
                start,
                end,
                limit,
                discover_changed_paths: verbose,
                strict_node_history: stop_on_copy,
            },
            out,
        ),
        Commands::History {
            path,
            node,
            rev,
            limit,
            stop_on_copy,
        } => {
            let store = open(&path)?;
            let rev = resolve_rev(&store, rev)?;
            let options = HistoryOptions {
                limit,
                cross_copies: !stop_on_copy,
            };
            for entry in store.history(&node, rev, options)? {
                let entry = entry?;
                writeln!(out, "r{}\t{}", entry.rev, entry.path)?;
            }
            Ok(())
        }
        Commands::Ls {
            path,
            node,
            rev,
            recursive,
        } => {
            let store = open(&path)?;
            let rev = resolve_rev(&store, rev)?;
            let depth = if recursive {
                Depth::Infinity
            } else {
                Depth::Immediates
            };
            for entry in store.list_dir_with(&node, rev, ListOptions { depth })? {
                let entry = entry?;
                match entry.kind {
                    NodeKind::Directory => {
                        writeln!(out, "{:>8} {:>10} {}/", entry.created_rev, "", entry.path)?
                    }
                    NodeKind::File => writeln!(
                        out,
                        "{:>8} {:>10} {}",
                        entry.created_rev,
                        entry.size.unwrap_or(0),
                        entry.path
                    )?,
                }
            }
            Ok(())
        }
        Commands::Cat { path, node, rev } => {
            let store = open(&path)?;
            let rev = resolve_rev(&store, rev)?;
            store.read_content(&node, rev)?.copy_to(out)?;
            Ok(())
        }
        Commands::Lstxns { path } => {
            for id in open(&path)?.list_transactions()? {
                writeln!(out, "{}", id)?;
            }
            Ok(())
        }
        Commands::Rmtxns { path, ids } => {
            let store = open(&path)?;
            for id in ids {
                store
                    .purge_transaction(&id)
                    .with_context(|| format!("removing transaction {}", id))?;
                writeln!(out, "Transaction '{}' removed.", id)?;
            }
            Ok(())
        }
        Commands::Setrevprop {
            path,
            rev,
            name,
            value,
            delete,
        } => {
            if value.is_none() && !delete {
                bail!("a value or --delete is required");
            }
            let store = open(&path)?;
            store.set_revision_prop(rev, &name, value.as_deref())?;
            match value {
                Some(_) => writeln!(out, "Property '{}' set on r{}", name, rev)?,
                None => writeln!(out, "Property '{}' deleted from r{}", name, rev)?,
            }
            Ok(())
        }
        Commands::Revprops { path, rev } => {
            for change in open(&path)?.revision_prop_journal(rev)? {
                writeln!(
                    out,
                    "#{} r{} {} {} {}",
                    change.seq,
                    change.rev,
                    change.action(),
                    change.name,
                    change.changed_at
                )?;
            }
            Ok(())
        }
    }
}

fn open(path: &Path) -> Result<Store> {
    Store::open(path).with_context(|| format!("opening store at {}", path.display()))
}

fn resolve_rev(store: &Store, rev: Option<u64>) -> Result<u64> {
    match rev {
        Some(rev) => Ok(rev),
        None => Ok(store.youngest_rev()?),
    }
}

fn create(path: &Path, policy: PolicyArg, no_hooks: bool, out: &mut impl Write) -> Result<()> {
    let policy = match policy {
        PolicyArg::Strict => CommitPolicy::Strict,
        PolicyArg::PathBased => CommitPolicy::PathBased,
    };
    let config = StoreConfig::default()
        .with_commit_policy(policy)
        .with_hooks(!no_hooks);
    let store = Store::create(path, config)
        .with_context(|| format!("creating store at {}", path.display()))?;
    writeln!(
        out,
        "Store created at {} (UUID: {})",
        path.display(),
        store.uuid()
    )?;
    Ok(())
}

fn info(store: &Store, out: &mut impl Write) -> Result<()> {
    let config = store.config();
    writeln!(out, "Path: {}", store.path().display())?;
    writeln!(out, "UUID: {}", store.uuid())?;
    writeln!(out, "Youngest: {}", store.youngest_rev()?)?;
    writeln!(out, "Node-revisions: {}", store.node_count()?)?;
    writeln!(out, "Commit policy: {:?}", config.commit_policy)?;
    writeln!(out, "Compression level: {}", config.compression_level)?;
    writeln!(out, "Hooks: {}", if config.hooks_enabled { "on" } else { "off" })?;
    Ok(())
}

fn verify(store: &Store, quiet: bool, out: &mut impl Write) -> Result<()> {
    if !quiet {
        writeln!(out, "Verifying store: {}", store.path().display())?;
    }
    let report = store.verify().context("verification failed")?;
    if !quiet {
        writeln!(out, "  Revisions:      {}", report.revisions)?;
        writeln!(out, "  Node-revisions: {}", report.nodes)?;
        writeln!(out, "  Contents:       {}", report.contents)?;
        writeln!(out, "Store is valid.")?;
    }
    Ok(())
}

fn log(store: &Store, options: LogOptions, out: &mut impl Write) -> Result<()> {
    let separator = "-".repeat(72);
    writeln!(out, "{}", separator)?;
    for entry in store.log(options)? {
        let entry = entry?;
        writeln!(
            out,
            "r{} | {} | {}",
            entry.rev,
            entry.author.as_deref().unwrap_or("(no author)"),
            entry.date.as_deref().unwrap_or("(no date)")
        )?;
        if let Some(changed) = &entry.changed_paths {
            writeln!(out, "Changed paths:")?;
            for change in changed {
                match &change.copy_from {
                    Some(cf) => writeln!(
                        out,
                        "   {} {} (from {}:{})",
                        change.action.code(),
                        change.path,
                        cf.path,
                        cf.rev
                    )?,
                    None => writeln!(out, "   {} {}", change.action.code(), change.path)?,
                }
            }
        }
        writeln!(out)?;
        writeln!(out, "{}", entry.message.as_deref().unwrap_or(""))?;
        writeln!(out, "{}", separator)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use revfs_core::TxnOptions;
    use tempfile::TempDir;

    fn output(command: Commands) -> String {
        let mut out = Vec::new();
        run(command, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn seeded() -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store");
        output(Commands::Create {
            path: path.clone(),
            policy: PolicyArg::Strict,
            no_hooks: true,
        });
        let store = Store::open(&path).unwrap();
        let mut txn = store
            .begin_txn(TxnOptions::at(0).author("alice").message("import"))
            .unwrap();
        txn.mkdir("/docs").unwrap();
        txn.mkfile("/docs/readme").unwrap();
        txn.set_contents("/docs/readme", b"read me").unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin_txn(TxnOptions::at(1)).unwrap();
        txn.copy("/docs", 1, "/archive").unwrap();
        txn.commit().unwrap();
        (tmp, path)
    }

    #[test]
    fn test_info_reports_youngest() {
        let (_tmp, path) = seeded();
        let text = output(Commands::Info { path });
        assert!(text.contains("Youngest: 2"));
        assert!(text.contains("Commit policy: Strict"));
        assert!(text.contains("Hooks: off"));
    }

    #[test]
    fn test_log_and_history_output() {
        let (_tmp, path) = seeded();
        let text = output(Commands::Log {
            path: path.clone(),
            node: "/archive/readme".into(),
            start: None,
            end: 0,
            limit: None,
            verbose: true,
            stop_on_copy: false,
        });
        assert!(text.contains("r1 | alice |"));
        assert!(text.contains("A /archive (from /docs:1)"));
        assert!(text.contains("import"));

        let text = output(Commands::History {
            path,
            node: "/archive/readme".into(),
            rev: None,
            limit: None,
            stop_on_copy: false,
        });
        assert_eq!(text, "r2\t/archive/readme\nr1\t/docs/readme\n");
    }

    #[test]
    fn test_ls_and_cat() {
        let (_tmp, path) = seeded();
        let text = output(Commands::Ls {
            path: path.clone(),
            node: "/".into(),
            rev: None,
            recursive: true,
        });
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("/archive/"));
        assert!(lines[3].ends_with("/docs/readme"));

        let text = output(Commands::Cat {
            path,
            node: "/docs/readme".into(),
            rev: Some(1),
        });
        assert_eq!(text, "read me");
    }

    #[test]
    fn test_setrevprop_and_journal() {
        let (_tmp, path) = seeded();
        output(Commands::Setrevprop {
            path: path.clone(),
            rev: 1,
            name: "svn:log".into(),
            value: Some("better message".into()),
            delete: false,
        });
        let text = output(Commands::Revprops {
            path: path.clone(),
            rev: Some(1),
        });
        assert!(text.contains("r1 M svn:log"));

        let mut out = Vec::new();
        let err = run(
            Commands::Setrevprop {
                path,
                rev: 1,
                name: "svn:log".into(),
                value: None,
                delete: false,
            },
            &mut out,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_transactions_listing_and_removal() {
        let (_tmp, path) = seeded();
        // A crashed writer leaves its staging directory behind
        let id = "1-0123456789abcdef";
        std::fs::create_dir(path.join("txns").join(id)).unwrap();

        let listed = output(Commands::Lstxns { path: path.clone() });
        assert_eq!(listed.trim(), id);

        let text = output(Commands::Rmtxns {
            path: path.clone(),
            ids: vec![id.to_string()],
        });
        assert!(text.contains("removed"));
        assert!(output(Commands::Lstxns { path: path.clone() }).is_empty());

        let mut out = Vec::new();
        let missing = run(
            Commands::Rmtxns {
                path,
                ids: vec![id.to_string()],
            },
            &mut out,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn test_verify_and_delete() {
        let (_tmp, path) = seeded();
        let text = output(Commands::Verify {
            path: path.clone(),
            quiet: false,
        });
        assert!(text.contains("Revisions:      3"));
        assert!(text.contains("Store is valid."));

        output(Commands::Delete { path: path.clone() });
        assert!(!path.exists());
        let mut out = Vec::new();
        assert!(run(Commands::Info { path }, &mut out).is_err());
    }
}
