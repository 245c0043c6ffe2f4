//! Command-line interface definitions.
use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use crate::engine::OperationKind;

/// Top-level CLI entry point for the statekeep engine.
#[derive(Parser, Debug)]
#[command(
    name = "statekeep",
    about = "Template-driven machine configuration backup and restore",
    version
)]
pub struct Cli {
    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture backup and sync items into a new snapshot
    Backup(RunOpts),
    /// Capture sync items into a new snapshot
    Sync(RunOpts),
    /// Apply a snapshot to this machine
    Restore(RunOpts),
    /// Remove applications recorded in a snapshot
    Uninstall(RunOpts),
    /// Print version information
    Version,
}

impl Command {
    /// Operation run by this subcommand, or `None` for `version`.
    #[must_use]
    pub const fn operation(&self) -> Option<(OperationKind, &RunOpts)> {
        match self {
            Self::Backup(opts) => Some((OperationKind::Backup, opts)),
            Self::Sync(opts) => Some((OperationKind::Sync, opts)),
            Self::Restore(opts) => Some((OperationKind::Restore, opts)),
            Self::Uninstall(opts) => Some((OperationKind::Uninstall, opts)),
            Self::Version => None,
        }
    }

    /// Subcommand name, used for the log file.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.operation().map_or("version", |(op, _)| op.as_str())
    }
}

/// Options shared by the four operations.
#[derive(Parser, Debug, Clone)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .args(["snapshot", "snapshot_root"])
))]
pub struct RunOpts {
    /// Template file to run
    #[arg(short, long)]
    pub template: PathBuf,

    /// Snapshot directory
    #[arg(short, long)]
    pub snapshot: Option<PathBuf>,

    /// Directory under which a timestamped snapshot is created (backup and sync)
    #[arg(long)]
    pub snapshot_root: Option<PathBuf>,

    /// Engine configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Environment variable holding the encryption passphrase
    #[arg(long, conflicts_with = "key_file")]
    pub key_env: Option<String>,

    /// File holding the encryption passphrase
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Timeout for every external command, in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,
}
