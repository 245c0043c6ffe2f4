//! On-disk snapshot layout, manifest and lock file.
//!
//! ```text
//! <snapshot>/
//! ├── manifest.json
//! ├── files/<dynamic_state_path>
//! ├── registry/<dynamic_state_path>
//! └── applications/<dynamic_state_path>
//! <snapshot>.lock          (only while a run holds it)
//! ```
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::OperationKind;
use crate::error::SnapshotError;
use crate::template::Category;

/// Name of the manifest file at the snapshot root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest format written by this version.
pub const MANIFEST_VERSION: u32 = 1;

/// Checksum of one file inside a directory capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    /// Path relative to the captured directory, `/`-separated.
    pub path: String,
    /// Hex SHA-256 of the plaintext bytes.
    pub sha256: String,
}

/// What was captured for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Item category.
    pub category: Category,
    /// Item name.
    pub name: String,
    /// `dynamic_state_path` relative to the category directory.
    pub path: String,
    /// Whether the artifact bytes are encryption envelopes.
    #[serde(default)]
    pub encrypted: bool,
    /// Hex SHA-256 of the plaintext artifact (single files and documents).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Per-file checksums for directory captures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileChecksum>,
}

impl ArtifactRecord {
    /// A record with no checksums.
    #[must_use]
    pub fn new(category: Category, name: &str, path: &str, encrypted: bool) -> Self {
        Self {
            category,
            name: name.to_string(),
            path: path.to_string(),
            encrypted,
            sha256: None,
            files: Vec::new(),
        }
    }
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub format_version: u32,
    /// `metadata.name` of the template.
    pub template_name: String,
    /// `metadata.version` of the template.
    #[serde(default)]
    pub template_version: Option<String>,
    /// Operation that produced the snapshot.
    pub operation: OperationKind,
    /// Machine the snapshot was taken on.
    pub machine_name: String,
    /// Creation time (RFC 3339).
    pub created_at: DateTime<Utc>,
    /// Whether the capturing run was cancelled part-way.
    #[serde(default)]
    pub cancelled: bool,
    /// One record per captured item.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

impl Manifest {
    /// Find the record for an item by category and state path, falling
    /// back to the item name.
    #[must_use]
    pub fn find(
        &self,
        category: Category,
        name: &str,
        state_path: Option<&str>,
    ) -> Option<&ArtifactRecord> {
        let in_category = || self.artifacts.iter().filter(move |a| a.category == category);
        state_path
            .and_then(|p| in_category().find(|a| a.path == p))
            .or_else(|| in_category().find(|a| a.name == name))
    }
}

/// A snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: PathBuf,
}

impl Snapshot {
    /// Wrap an existing or to-be-created snapshot directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Snapshot root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of an artifact.
    #[must_use]
    pub fn artifact_path(&self, category: Category, state_path: &str) -> PathBuf {
        let mut path = self.root.join(category.as_str());
        for part in state_path.split(['/', '\\']).filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Create the snapshot directory.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if the directory cannot be created.
    pub fn create(&self) -> Result<(), SnapshotError> {
        std::fs::create_dir_all(&self.root).map_err(|source| SnapshotError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// Write `manifest.json`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the manifest cannot be serialized or written.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), SnapshotError> {
        let path = self.root.join(MANIFEST_FILE);
        let bytes =
            serde_json::to_vec_pretty(manifest).map_err(|e| SnapshotError::Manifest {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        std::fs::write(&path, bytes).map_err(|source| SnapshotError::Io { path, source })
    }

    /// Read `manifest.json`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Manifest`] if it is missing or unreadable.
    pub fn read_manifest(&self) -> Result<Manifest, SnapshotError> {
        let path = self.root.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|e| SnapshotError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Manifest {
            path,
            reason: e.to_string(),
        })
    }
}

/// Settle the path a run locks and works in.
///
/// Restore and Uninstall need an existing directory, returned
/// canonicalized. Backup and Sync get their parent directory created and
/// canonicalized, so every run on one snapshot agrees on the lock path.
///
/// # Errors
///
/// Returns [`SnapshotError::NotFound`] for a missing apply target and
/// [`SnapshotError::Io`] if a directory cannot be created or resolved.
pub fn locate(path: &Path, operation: OperationKind) -> Result<PathBuf, SnapshotError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SnapshotError::Io { path, source }
    };
    if !operation.captures() {
        if !path.is_dir() {
            return Err(SnapshotError::NotFound(path.to_path_buf()));
        }
        return dunce::canonicalize(path).map_err(io(path));
    }
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(path.to_path_buf());
    };
    if parent.as_os_str().is_empty() {
        return Ok(path.to_path_buf());
    }
    std::fs::create_dir_all(parent).map_err(io(parent))?;
    Ok(dunce::canonicalize(parent).map_err(io(parent))?.join(name))
}

/// Check the snapshot directory once the run holds its lock.
///
/// Restore and Uninstall need an existing directory; Backup and Sync need
/// a path that does not exist yet.
///
/// # Errors
///
/// Returns [`SnapshotError::NotFound`] or [`SnapshotError::Exists`].
pub fn preflight(path: &Path, operation: OperationKind) -> Result<(), SnapshotError> {
    if operation.captures() {
        if path.exists() {
            return Err(SnapshotError::Exists(path.to_path_buf()));
        }
    } else if !path.is_dir() {
        return Err(SnapshotError::NotFound(path.to_path_buf()));
    }
    Ok(())
}

/// Short identifier of a snapshot: its directory name.
#[must_use]
pub fn snapshot_id(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

/// `<root>/YYYYMMDD-HHMMSS`.
#[must_use]
pub fn timestamped_path(root: &Path, at: NaiveDateTime) -> PathBuf {
    root.join(at.format("%Y%m%d-%H%M%S").to_string())
}

/// Exclusive lock on a snapshot, held as `<snapshot>.lock` next to it.
///
/// The lock file is removed when the guard is dropped.
#[derive(Debug)]
pub struct SnapshotLock {
    path: PathBuf,
}

impl SnapshotLock {
    /// Lock path for a snapshot directory.
    #[must_use]
    pub fn path_for(snapshot: &Path) -> PathBuf {
        let mut name = snapshot
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        snapshot.with_file_name(name)
    }

    /// Take the lock, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Busy`] if another run holds the lock and
    /// [`SnapshotError::Io`] if the lock file cannot be written.
    pub fn acquire(snapshot: &Path) -> Result<Self, SnapshotError> {
        let path = Self::path_for(snapshot);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SnapshotError::Busy(path));
            }
            Err(source) => return Err(SnapshotError::Io { path, source }),
        };
        let lock = Self { path };
        writeln!(file, "{}", std::process::id()).map_err(|source| SnapshotError::Io {
            path: lock.path.clone(),
            source,
        })?;
        Ok(lock)
    }

    /// Path of the held lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
