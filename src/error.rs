//! Domain-specific error types for the template execution engine.
//!
//! Internal modules return typed errors while the CLI boundary converts them
//! to [`anyhow::Error`] via the standard `?` operator.
//!
//! # Error hierarchy
//!
//! ```text
//! EngineError
//! ├── Schema(SchemaError)     — template malformed, always fatal
//! ├── Resolve(ResolveError)   — inheritance resolution, fatal under strict
//! └── Snapshot(SnapshotError) — pre-flight checks and manifest writes
//! ```
//!
//! Item-scoped failures ([`ItemError`](crate::extractors::ItemError)) never
//! appear here: they are recorded in the
//! [`ExecutionReport`](crate::engine::ExecutionReport) instead.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal error returned by [`Engine::execute`](crate::engine::Engine::execute).
#[derive(Error, Debug)]
pub enum EngineError {
    /// The template document is malformed.
    #[error("Template error: {0}")]
    Schema(#[from] SchemaError),

    /// Inheritance resolution failed fatally.
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    /// The snapshot directory failed a pre-flight check.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Errors raised while loading and validating a template document.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The template file could not be read.
    #[error("cannot read template {path}: {source}")]
    Read {
        /// Path of the template file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document is not valid YAML or does not fit the schema shape
    /// (missing required field, unknown enum value, wrong type).
    #[error("malformed template: {0}")]
    Malformed(String),

    /// The document parsed but violates one or more schema rules.
    #[error("invalid template ({} violation(s)): {}", .0.len(), .0.join("; "))]
    Invalid(Vec<String>),
}

/// Errors raised by the inheritance resolver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// An inheritance rule failed to execute or produced unusable output.
    #[error("inheritance rule '{rule}' failed on {item}: {reason}")]
    RuleExecution {
        /// Name of the rule.
        rule: String,
        /// Item the rule was applied to.
        item: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Two items sharing a merge key could not be merged with `merge_both`.
    #[error("cannot merge '{item}': {reason}")]
    MergeConflict {
        /// Name of the conflicting item.
        item: String,
        /// Why the items are incompatible.
        reason: String,
    },

    /// `fallback_strategy: fail` and no machine or conditional section matched.
    #[error("no machine-specific or conditional section matches this host")]
    NoMatchingSection,
}

/// Errors raised by pre-flight snapshot checks.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Restore/Uninstall pointed at a snapshot that does not exist.
    #[error("snapshot not found: {0}")]
    NotFound(PathBuf),

    /// Backup/Sync pointed at a snapshot directory that already exists.
    #[error("snapshot already exists: {0}")]
    Exists(PathBuf),

    /// Another run holds the lock for this snapshot.
    #[error("snapshot is busy (lock file {0} exists)")]
    Busy(PathBuf),

    /// The snapshot manifest is missing or unreadable.
    #[error("snapshot manifest error in {path}: {reason}")]
    Manifest {
        /// Path of the manifest file.
        path: PathBuf,
        /// Why the manifest could not be used.
        reason: String,
    },

    /// An I/O error occurred while preparing the snapshot.
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        /// Path that could not be accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// A prerequisite whose `on_missing` policy is fatal for the current operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("prerequisite '{name}' is not satisfied: {message}")]
pub struct PrerequisiteFailure {
    /// Name of the prerequisite.
    pub name: String,
    /// Detail from the check.
    pub message: String,
}
