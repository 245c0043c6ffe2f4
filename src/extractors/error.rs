//! Item-scoped errors.
//!
//! An [`ItemError`] fails one item; the orchestrator records it in the
//! report and moves on to the next item.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::registry_store::RegistryError;
use crate::crypto::CryptoError;
use crate::exec::ExecError;

/// Why a single item could not be captured, applied or removed.
#[derive(Error, Debug)]
pub enum ItemError {
    /// The item's source does not exist on this host.
    #[error("source not found: {0}")]
    SourceMissing(PathBuf),

    /// A filesystem operation failed.
    #[error("{action} {path}: {source}")]
    Io {
        /// What was being done (`read`, `write`, `create`, ...).
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An external command or script failed.
    #[error("{0}")]
    Command(String),

    /// An external command exceeded its time limit.
    #[error("timeout after {}s: {program}", .timeout.as_secs())]
    Timeout {
        /// Program that timed out.
        program: String,
        /// Limit that was exceeded.
        timeout: Duration,
    },

    /// The run was cancelled while the item was in progress.
    #[error("cancelled")]
    Cancelled,

    /// Output or artifact content could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// An artifact could not be encrypted or decrypted, or no key was
    /// available.
    #[error(transparent)]
    Decryption(#[from] CryptoError),

    /// Restored content does not match the checksum recorded at capture.
    #[error("checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// File that was checked.
        path: PathBuf,
        /// Checksum from the manifest.
        expected: String,
        /// Checksum of the restored bytes.
        actual: String,
    },

    /// The snapshot holds no artifact for this item.
    #[error("no artifact in snapshot for {0}")]
    ArtifactMissing(String),

    /// The category does not support the requested operation.
    #[error("operation '{operation}' is not supported for {category} items")]
    UnsupportedOperation {
        /// Operation name.
        operation: &'static str,
        /// Category name.
        category: &'static str,
    },

    /// The registry-equivalent store failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ExecError> for ItemError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Timeout { program, timeout } => Self::Timeout { program, timeout },
            ExecError::Cancelled { .. } => Self::Cancelled,
            other => Self::Command(other.to_string()),
        }
    }
}

impl ItemError {
    /// Wrap an I/O error with the action and path.
    #[must_use]
    pub fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}
