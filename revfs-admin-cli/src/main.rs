//! revfs Administration CLI

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "revfs-admin")]
#[command(author = "revfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "revfs store administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyArg {
    /// Reject any commit whose base is not the youngest revision
    Strict,
    /// Accept stale commits that touch no path changed since their base
    PathBased,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new store
    Create {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = PolicyArg::Strict)]
        policy: PolicyArg,
        /// Do not run hook scripts
        #[arg(long)]
        no_hooks: bool,
    },

    /// Delete a store and everything in it
    Delete { path: PathBuf },

    /// Show store uuid, youngest revision and configuration
    Info { path: PathBuf },

    /// Check every revision's nodes and content
    Verify {
        path: PathBuf,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the revision log of a path
    Log {
        path: PathBuf,
        #[arg(default_value = "/")]
        node: String,
        /// Newest revision (defaults to youngest)
        #[arg(short = 'r', long)]
        start: Option<u64>,
        /// Oldest revision
        #[arg(short, long, default_value_t = 0)]
        end: u64,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Show changed paths
        #[arg(short, long)]
        verbose: bool,
        #[arg(long)]
        stop_on_copy: bool,
    },

    /// Print the path history of a node
    History {
        path: PathBuf,
        node: String,
        #[arg(short, long)]
        rev: Option<u64>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        stop_on_copy: bool,
    },

    /// List a directory
    Ls {
        path: PathBuf,
        #[arg(default_value = "/")]
        node: String,
        #[arg(short, long)]
        rev: Option<u64>,
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Write a file's content to stdout
    Cat {
        path: PathBuf,
        node: String,
        #[arg(short, long)]
        rev: Option<u64>,
    },

    /// List transactions left in the store
    Lstxns { path: PathBuf },

    /// Remove dead transactions
    Rmtxns {
        path: PathBuf,
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Set or delete a revision property
    Setrevprop {
        path: PathBuf,
        rev: u64,
        name: String,
        value: Option<String>,
        #[arg(long, conflicts_with = "value")]
        delete: bool,
    },

    /// Print the revision property change journal
    Revprops {
        path: PathBuf,
        #[arg(short, long)]
        rev: Option<u64>,
    },
}

fn init_logging(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    tracing::debug!(command = ?cli.command, "revfs-admin");
    let mut out = std::io::stdout().lock();
    commands::run(cli.command, &mut out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_with_policy() {
        let cli = Cli::try_parse_from([
            "revfs-admin",
            "create",
            "/tmp/store",
            "--policy",
            "path-based",
            "--no-hooks",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                path,
                policy,
                no_hooks,
            } => {
                assert_eq!(path, PathBuf::from("/tmp/store"));
                assert_eq!(policy, PolicyArg::PathBased);
                assert!(no_hooks);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_log_defaults() {
        let cli = Cli::try_parse_from(["revfs-admin", "--debug", "log", "/tmp/store"]).unwrap();
        assert!(cli.debug);
        match cli.command {
            Commands::Log {
                node, start, end, ..
            } => {
                assert_eq!(node, "/");
                assert_eq!(start, None);
                assert_eq!(end, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_setrevprop_value_conflicts_with_delete() {
        let result = Cli::try_parse_from([
            "revfs-admin",
            "setrevprop",
            "/tmp/store",
            "1",
            "svn:log",
            "msg",
            "--delete",
        ]);
        assert!(result.is_err());
        assert!(Cli::try_parse_from(["revfs-admin", "rmtxns", "/tmp/store"]).is_err());
    }
}
