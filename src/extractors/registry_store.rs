//! Registry-equivalent key/value store.
//!
//! On Windows values live in the native registry and are reached through
//! `PowerShell`; elsewhere (and in tests) a JSON document on disk stands in
//! for it. Both sides speak [`RegistryData`], which is also the on-disk
//! form of registry artifacts.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::exec::{CancelToken, CommandRequest, Executor};
use crate::template::RegistryValueKind;
use crate::template::items::value_to_string;

/// Values under one key, by value name.
pub type KeyValues = BTreeMap<String, RegistryData>;

/// Typed registry-equivalent value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RegistryData {
    /// `REG_SZ`.
    String(String),
    /// `REG_EXPAND_SZ`, stored unexpanded.
    ExpandString(String),
    /// `REG_DWORD`.
    Dword(u32),
    /// `REG_QWORD`.
    Qword(u64),
    /// `REG_BINARY`, base64 in JSON.
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    /// `REG_MULTI_SZ`.
    MultiString(Vec<String>),
}

mod base64_bytes {
    use super::{BASE64, Deserialize, Deserializer, Serializer};
    use base64::Engine as _;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

impl RegistryData {
    /// The value type of this data.
    #[must_use]
    pub const fn kind(&self) -> RegistryValueKind {
        match self {
            Self::String(_) => RegistryValueKind::String,
            Self::ExpandString(_) => RegistryValueKind::ExpandString,
            Self::Dword(_) => RegistryValueKind::Dword,
            Self::Qword(_) => RegistryValueKind::Qword,
            Self::Binary(_) => RegistryValueKind::Binary,
            Self::MultiString(_) => RegistryValueKind::MultiString,
        }
    }

    /// Plain-text rendering used for comparisons in selectors and
    /// prerequisite checks.
    #[must_use]
    pub fn display_string(&self) -> String {
        match self {
            Self::String(s) | Self::ExpandString(s) => s.clone(),
            Self::Dword(n) => n.to_string(),
            Self::Qword(n) => n.to_string(),
            Self::Binary(bytes) => hex::encode(bytes),
            Self::MultiString(parts) => parts.join("\n"),
        }
    }

    /// Build typed data from a template's `value_data` and `value_kind`.
    ///
    /// Numbers accept decimal or `0x` hex strings; binary accepts a list
    /// of byte values or a hex string; multi-strings accept a list or a
    /// newline-separated string.
    ///
    /// # Errors
    ///
    /// Returns a description of why `value` does not fit `kind`.
    pub fn from_template(kind: RegistryValueKind, value: &Value) -> Result<Self, String> {
        let text = || value_to_string(value);
        match kind {
            RegistryValueKind::String => Ok(Self::String(text())),
            RegistryValueKind::ExpandString => Ok(Self::ExpandString(text())),
            RegistryValueKind::Dword => {
                let n = parse_number(value)?;
                u32::try_from(n)
                    .map(Self::Dword)
                    .map_err(|_| format!("{n} does not fit a dword"))
            }
            RegistryValueKind::Qword => parse_number(value).map(Self::Qword),
            RegistryValueKind::Binary => match value {
                Value::Array(items) => items
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or_else(|| format!("{v} is not a byte"))
                    })
                    .collect::<Result<Vec<u8>, String>>()
                    .map(Self::Binary),
                other => hex::decode(value_to_string(other))
                    .map(Self::Binary)
                    .map_err(|e| format!("invalid hex data: {e}")),
            },
            RegistryValueKind::MultiString => Ok(Self::MultiString(match value {
                Value::Array(items) => items
                    .iter()
                    .map(value_to_string)
                    .collect(),
                other => value_to_string(other)
                    .lines()
                    .map(ToString::to_string)
                    .collect(),
            })),
        }
    }
}

fn parse_number(value: &Value) -> Result<u64, String> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let text = value_to_string(value);
    let trimmed = text.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| format!("'{trimmed}' is not a number"))
}

/// Errors raised by a [`RegistryStore`].
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The backing document could not be read or written.
    #[error("registry store I/O error at {path}: {source}")]
    Io {
        /// Path of the store document.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The backing document is not valid.
    #[error("registry store {path} is corrupt: {reason}")]
    Corrupt {
        /// Path of the store document.
        path: PathBuf,
        /// Parse error.
        reason: String,
    },

    /// The native registry command failed.
    #[error("registry command failed: {0}")]
    Command(String),
}

/// Read and write access to registry-equivalent state.
///
/// Key paths use `PowerShell` provider syntax (`HKCU:\Software\...`) and are
/// matched case-insensitively, like the native registry.
pub trait RegistryStore: Send + Sync {
    /// All values under `key`, `None` when the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read.
    fn read_key(&self, key: &str) -> Result<Option<KeyValues>, RegistryError>;

    /// One value, `None` when the key or value does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read.
    fn read_value(&self, key: &str, name: &str) -> Result<Option<RegistryData>, RegistryError> {
        Ok(self.read_key(key)?.and_then(|values| {
            values
                .into_iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, data)| data)
        }))
    }

    /// Write a value, creating the key when needed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be written.
    fn write_value(&self, key: &str, name: &str, data: &RegistryData) -> Result<(), RegistryError>;

    /// Delete a value. Deleting an absent value succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be written.
    fn delete_value(&self, key: &str, name: &str) -> Result<(), RegistryError>;

    /// Delete a key with its values and subkeys. Deleting an absent key
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be written.
    fn delete_key(&self, key: &str) -> Result<(), RegistryError>;
}

/// [`RegistryStore`] backed by a JSON document on disk.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    keys: BTreeMap<String, KeyValues>,
}

impl RegistryDocument {
    fn key_name(&self, key: &str) -> Option<String> {
        self.keys
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .cloned()
    }
}

impl FileRegistry {
    /// Create a store backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryDocument, RegistryError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| RegistryError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryDocument::default()),
            Err(source) => Err(RegistryError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn store(&self, doc: &RegistryDocument) -> Result<(), RegistryError> {
        let io = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| RegistryError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(io)?;
        std::fs::rename(&tmp, &self.path).map_err(io)
    }

    fn modify(
        &self,
        f: impl FnOnce(&mut RegistryDocument) -> bool,
    ) -> Result<(), RegistryError> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut doc = self.load()?;
        if f(&mut doc) {
            self.store(&doc)?;
        }
        Ok(())
    }
}

impl RegistryStore for FileRegistry {
    fn read_key(&self, key: &str) -> Result<Option<KeyValues>, RegistryError> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut doc = self.load()?;
        Ok(doc.key_name(key).and_then(|k| doc.keys.remove(&k)))
    }

    fn write_value(&self, key: &str, name: &str, data: &RegistryData) -> Result<(), RegistryError> {
        self.modify(|doc| {
            let key_name = doc.key_name(key).unwrap_or_else(|| key.to_string());
            let values = doc.keys.entry(key_name).or_default();
            values.retain(|n, _| !n.eq_ignore_ascii_case(name));
            values.insert(name.to_string(), data.clone());
            true
        })
    }

    fn delete_value(&self, key: &str, name: &str) -> Result<(), RegistryError> {
        self.modify(|doc| {
            let Some(values) = doc.key_name(key).and_then(|k| doc.keys.get_mut(&k)) else {
                return false;
            };
            let before = values.len();
            values.retain(|n, _| !n.eq_ignore_ascii_case(name));
            values.len() != before
        })
    }

    fn delete_key(&self, key: &str) -> Result<(), RegistryError> {
        let prefix = format!("{}\\", key.trim_end_matches('\\').to_ascii_lowercase());
        self.modify(|doc| {
            let before = doc.keys.len();
            doc.keys.retain(|k, _| {
                let lower = k.to_ascii_lowercase();
                !(lower.eq_ignore_ascii_case(key) || lower.starts_with(&prefix))
            });
            doc.keys.len() != before
        })
    }
}

/// Sentinel printed by the read scripts when a key does not exist.
const NOT_FOUND: &str = "::NOT_FOUND::";

/// [`RegistryStore`] for the native Windows registry via `PowerShell`.
pub struct PowerShellRegistry {
    executor: Arc<dyn Executor>,
    timeout: Duration,
    cancel: CancelToken,
}

impl std::fmt::Debug for PowerShellRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerShellRegistry")
            .field("executor", &"<dyn Executor>")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PowerShellRegistry {
    /// Create a store that runs `PowerShell` through `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            executor,
            timeout,
            cancel,
        }
    }

    fn run(&self, script: &str) -> Result<String, RegistryError> {
        let request = CommandRequest::new(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", script],
            self.timeout,
        )
        .with_cancel(self.cancel.clone());
        let result = self
            .executor
            .execute(&request)
            .map_err(|e| RegistryError::Command(e.to_string()))?;
        if !result.success {
            return Err(RegistryError::Command(result.stderr.trim().to_string()));
        }
        Ok(result.stdout)
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `Set-ItemProperty` value expression and type name for `data`.
fn powershell_value(data: &RegistryData) -> (String, &'static str) {
    match data {
        RegistryData::String(s) => (quote(s), "String"),
        RegistryData::ExpandString(s) => (quote(s), "ExpandString"),
        RegistryData::Dword(n) => (n.to_string(), "DWord"),
        RegistryData::Qword(n) => (n.to_string(), "QWord"),
        RegistryData::Binary(bytes) => {
            let list = bytes
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(",");
            (format!("([byte[]]@({list}))"), "Binary")
        }
        RegistryData::MultiString(parts) => {
            let list = parts.iter().map(|p| quote(p)).collect::<Vec<_>>().join(",");
            (format!("([string[]]@({list}))"), "MultiString")
        }
    }
}

/// Convert one `{kind, data}` entry emitted by the read script.
fn data_from_powershell(kind: &str, data: &Value) -> Option<RegistryData> {
    let text = || data.as_str().map(ToString::to_string);
    match kind {
        "String" => text().map(RegistryData::String),
        "ExpandString" => text().map(RegistryData::ExpandString),
        "DWord" => data.as_i64().and_then(|n| {
            u32::try_from(n)
                .ok()
                .or_else(|| i32::try_from(n).ok().map(i32::cast_unsigned))
        }).map(RegistryData::Dword),
        "QWord" => data
            .as_u64()
            .or_else(|| data.as_i64().map(i64::cast_unsigned))
            .map(RegistryData::Qword),
        "Binary" => data
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                    .collect()
            })
            .map(RegistryData::Binary),
        "MultiString" => match data {
            Value::Array(a) => Some(RegistryData::MultiString(
                a.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect(),
            )),
            Value::String(s) => Some(RegistryData::MultiString(vec![s.clone()])),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Deserialize)]
struct PsEntry {
    kind: String,
    data: Value,
}

impl RegistryStore for PowerShellRegistry {
    fn read_key(&self, key: &str) -> Result<Option<KeyValues>, RegistryError> {
        let k = quote(key);
        let mut script = String::from("$ErrorActionPreference='Stop'\n");
        let _ = write!(
            script,
            "if (!(Test-Path -LiteralPath {k})) {{ Write-Output '{NOT_FOUND}'; exit 0 }}\n\
             $key = Get-Item -LiteralPath {k}\n\
             $out = @{{}}\n\
             foreach ($n in $key.GetValueNames()) {{\n\
               $out[$n] = @{{ kind = $key.GetValueKind($n).ToString(); data = $key.GetValue($n, $null, 'DoNotExpandEnvironmentNames') }}\n\
             }}\n\
             ConvertTo-Json -InputObject $out -Depth 4 -Compress"
        );
        let output = self.run(&script)?;
        let output = output.trim();
        if output == NOT_FOUND {
            return Ok(None);
        }
        let raw: BTreeMap<String, PsEntry> = serde_json::from_str(output)
            .map_err(|e| RegistryError::Command(format!("unreadable registry output: {e}")))?;
        Ok(Some(
            raw.into_iter()
                .filter_map(|(name, entry)| {
                    data_from_powershell(&entry.kind, &entry.data).map(|d| (name, d))
                })
                .collect(),
        ))
    }

    fn write_value(&self, key: &str, name: &str, data: &RegistryData) -> Result<(), RegistryError> {
        let (k, n) = (quote(key), quote(name));
        let (value, kind) = powershell_value(data);
        self.run(&format!(
            "$ErrorActionPreference='Stop'\n\
             if (!(Test-Path -LiteralPath {k})) {{ New-Item -Path {k} -Force | Out-Null }}\n\
             New-ItemProperty -LiteralPath {k} -Name {n} -Value {value} -PropertyType {kind} -Force | Out-Null"
        ))
        .map(drop)
    }

    fn delete_value(&self, key: &str, name: &str) -> Result<(), RegistryError> {
        let (k, n) = (quote(key), quote(name));
        self.run(&format!(
            "if (Test-Path -LiteralPath {k}) {{ Remove-ItemProperty -LiteralPath {k} -Name {n} -ErrorAction SilentlyContinue }}"
        ))
        .map(drop)
    }

    fn delete_key(&self, key: &str) -> Result<(), RegistryError> {
        let k = quote(key);
        self.run(&format!(
            "if (Test-Path -LiteralPath {k}) {{ Remove-Item -LiteralPath {k} -Recurse -Force }}"
        ))
        .map(drop)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::exec::{ExecResult, MockExecutor};

    fn temp_store() -> (tempfile::TempDir, FileRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistry::new(dir.path().join("registry.json"));
        (dir, store)
    }

    #[test]
    fn file_registry_round_trip() {
        let (_dir, store) = temp_store();
        assert!(store.read_key("HKCU:\\Software\\App").unwrap().is_none());

        store
            .write_value("HKCU:\\Software\\App", "Mode", &RegistryData::Dword(1))
            .unwrap();
        store
            .write_value(
                "HKCU:\\Software\\App",
                "Blob",
                &RegistryData::Binary(vec![0, 255, 7]),
            )
            .unwrap();

        assert_eq!(
            store.read_value("hkcu:\\software\\app", "mode").unwrap(),
            Some(RegistryData::Dword(1))
        );
        let values = store.read_key("HKCU:\\Software\\App").unwrap().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["Blob"], RegistryData::Binary(vec![0, 255, 7]));
    }

    #[test]
    fn binary_data_is_base64_on_disk() {
        let (_dir, store) = temp_store();
        store
            .write_value("HKCU:\\A", "B", &RegistryData::Binary(b"hi".to_vec()))
            .unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"aGk=\""));
    }

    #[test]
    fn delete_value_and_key() {
        let (_dir, store) = temp_store();
        store
            .write_value("HKCU:\\A", "X", &RegistryData::String("1".into()))
            .unwrap();
        store
            .write_value("HKCU:\\A\\Sub", "Y", &RegistryData::String("2".into()))
            .unwrap();
        store
            .write_value("HKCU:\\AB", "Z", &RegistryData::String("3".into()))
            .unwrap();

        store.delete_value("HKCU:\\A", "X").unwrap();
        assert!(store.read_value("HKCU:\\A", "X").unwrap().is_none());
        assert!(store.read_key("HKCU:\\A").unwrap().is_some());

        store.delete_key("HKCU:\\A").unwrap();
        assert!(store.read_key("HKCU:\\A").unwrap().is_none());
        assert!(store.read_key("HKCU:\\A\\Sub").unwrap().is_none());
        assert!(store.read_key("HKCU:\\AB").unwrap().is_some());

        store.delete_key("HKCU:\\Missing").unwrap();
    }

    #[test]
    fn corrupt_document_is_reported() {
        let (_dir, store) = temp_store();
        std::fs::write(store.path(), "not json").unwrap();
        assert!(matches!(
            store.read_key("HKCU:\\A"),
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[test]
    fn from_template_converts_kinds() {
        assert_eq!(
            RegistryData::from_template(RegistryValueKind::Dword, &Value::from("0x0E")).unwrap(),
            RegistryData::Dword(14)
        );
        assert_eq!(
            RegistryData::from_template(RegistryValueKind::String, &Value::from(1)).unwrap(),
            RegistryData::String("1".into())
        );
        assert_eq!(
            RegistryData::from_template(RegistryValueKind::Binary, &Value::from("0aff")).unwrap(),
            RegistryData::Binary(vec![10, 255])
        );
        assert!(RegistryData::from_template(RegistryValueKind::Dword, &Value::from(u64::MAX)).is_err());
    }

    #[test]
    fn powershell_value_formats() {
        assert_eq!(
            powershell_value(&RegistryData::String("it's".into())),
            ("'it''s'".to_string(), "String")
        );
        assert_eq!(
            powershell_value(&RegistryData::Binary(vec![1, 2])),
            ("([byte[]]@(1,2))".to_string(), "Binary")
        );
    }

    #[test]
    fn powershell_read_key_parses_output() {
        let mut mock = MockExecutor::new();
        mock.expect_execute().returning(|req| {
            assert_eq!(req.program, "powershell");
            Ok(ExecResult {
                stdout: r#"{"Mode":{"kind":"DWord","data":-1},"Name":{"kind":"String","data":"x"}}"#
                    .to_string(),
                stderr: String::new(),
                success: true,
                code: Some(0),
            })
        });
        let store = PowerShellRegistry::new(
            Arc::new(mock),
            Duration::from_secs(5),
            CancelToken::new(),
        );
        let values = store.read_key("HKCU:\\A").unwrap().unwrap();
        assert_eq!(values["Mode"], RegistryData::Dword(u32::MAX));
        assert_eq!(values["Name"], RegistryData::String("x".into()));
    }

    #[test]
    fn powershell_missing_key() {
        let mut mock = MockExecutor::new();
        mock.expect_execute().returning(|_| {
            Ok(ExecResult {
                stdout: format!("{NOT_FOUND}\r\n"),
                stderr: String::new(),
                success: true,
                code: Some(0),
            })
        });
        let store = PowerShellRegistry::new(
            Arc::new(mock),
            Duration::from_secs(5),
            CancelToken::new(),
        );
        assert!(store.read_key("HKCU:\\A").unwrap().is_none());
    }
}
