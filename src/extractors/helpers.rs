//! Shared helpers for extractors: path expansion, checksums and
//! artifact I/O.
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::ItemError;
use crate::crypto::Vault;
use crate::platform::HostContext;

/// Expand `~`, `${NAME}`, `$NAME` and `%NAME%` against the host environment.
///
/// Unset variables are left as written.
#[must_use]
pub fn expand_path(raw: &str, host: &HostContext) -> PathBuf {
    let expanded = match (host.home(), raw.strip_prefix('~')) {
        (Some(home), Some(rest)) if rest.is_empty() || rest.starts_with(['/', '\\']) => {
            format!("{home}{rest}")
        }
        _ => raw.to_string(),
    };
    PathBuf::from(expand_vars(&expanded, host))
}

fn expand_vars(text: &str, host: &HostContext) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(['$', '%']) {
        let (before, tail) = rest.split_at(pos);
        out.push_str(before);
        let (name, consumed) = variable_at(tail);
        let (token, after) = tail.split_at(consumed);
        match name.and_then(|n| host.env_var(n)) {
            Some(value) => out.push_str(value),
            None => out.push_str(token),
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Variable name referenced at the start of `tail` and the length of the
/// reference. A lone marker yields no name and length 1.
fn variable_at(tail: &str) -> (Option<&str>, usize) {
    if let Some(body) = tail.strip_prefix("${") {
        return body
            .split_once('}')
            .map_or((None, 1), |(name, _)| (Some(name), name.len() + 3));
    }
    if let Some(body) = tail.strip_prefix('$') {
        let end = body
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(body.len());
        return if end == 0 {
            (None, 1)
        } else {
            (Some(body.split_at(end).0), end + 1)
        };
    }
    if let Some(body) = tail.strip_prefix('%') {
        return body
            .split_once('%')
            .filter(|(name, _)| !name.is_empty())
            .map_or((None, 1), |(name, _)| (Some(name), name.len() + 2));
    }
    (None, 1)
}

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write an artifact, creating parent directories and encrypting when
/// asked.
///
/// # Errors
///
/// Returns [`ItemError`] on encryption or I/O failure.
pub fn write_artifact(
    path: &Path,
    plaintext: &[u8],
    encrypt: bool,
    vault: &Vault,
) -> Result<(), ItemError> {
    let bytes = if encrypt {
        vault.encrypt(plaintext)?
    } else {
        plaintext.to_vec()
    };
    write_file(path, &bytes)
}

/// Read an artifact, decrypting when it was written encrypted.
///
/// # Errors
///
/// Returns [`ItemError`] on I/O or decryption failure.
pub fn read_artifact(path: &Path, encrypted: bool, vault: &Vault) -> Result<Vec<u8>, ItemError> {
    let bytes = std::fs::read(path).map_err(ItemError::io("read", path))?;
    if encrypted {
        Ok(vault.decrypt(&bytes)?)
    } else {
        Ok(bytes)
    }
}

/// Write `bytes` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ItemError::Io`] if a directory or the file cannot be written.
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ItemError> {
    ensure_parent_dir(path)?;
    std::fs::write(path, bytes).map_err(ItemError::io("write", path))
}

/// Ensure the parent directory of `path` exists.
///
/// # Errors
///
/// Returns [`ItemError::Io`] if the directory cannot be created.
pub fn ensure_parent_dir(path: &Path) -> Result<(), ItemError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ItemError::io("create", parent))?;
    }
    Ok(())
}

/// Every regular file under `dir`, as `/`-separated relative paths in
/// sorted order. Directory symlinks are followed.
///
/// # Errors
///
/// Returns [`ItemError::Io`] if a directory cannot be read.
pub fn list_files(dir: &Path) -> Result<Vec<String>, ItemError> {
    let mut out = Vec::new();
    walk(dir, "", &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), ItemError> {
    for entry in std::fs::read_dir(dir).map_err(ItemError::io("read directory", dir))? {
        let entry = entry.map_err(ItemError::io("read directory", dir))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let path = entry.path();
        if path.is_dir() {
            walk(&path, &rel, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}

/// Join a `/`-separated relative path onto `base`.
#[must_use]
pub fn join_relative(base: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|p| !p.is_empty())
        .fold(base.to_path_buf(), |acc, part| acc.join(part))
}
