//! Registry-equivalent items.
//!
//! A capture is a JSON [`RegistryArtifact`]. When the key or value does not
//! exist the artifact says so explicitly, and applying it deletes the key
//! or value again.
use serde::{Deserialize, Serialize};

use super::helpers::{read_artifact, sha256_hex, write_artifact};
use super::registry_store::{KeyValues, RegistryData, RegistryStore};
use super::{ExtractContext, Extractor, ItemError, state_path};
use crate::snapshot::ArtifactRecord;
use crate::template::{Category, RegistryItem, RegistryKind};
use crate::warning::Warning;

/// On-disk form of a registry capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryArtifact {
    /// Key path.
    pub key_path: String,
    /// Value name for single-value captures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_name: Option<String>,
    /// The key (or value) did not exist at capture time.
    pub absent: bool,
    /// Captured values; a single entry for value captures.
    #[serde(default)]
    pub values: KeyValues,
}

/// Extractor for [`RegistryItem`]s.
#[derive(Debug, Clone, Copy)]
pub struct RegistryExtractor;

fn label(item: &RegistryItem) -> String {
    format!("registry/{}", item.common.name)
}

fn value_name(item: &RegistryItem) -> Result<&str, ItemError> {
    item.value_name
        .as_deref()
        .ok_or_else(|| ItemError::Parse(format!("{} has no value_name", label(item))))
}

impl Extractor for RegistryExtractor {
    type Item = RegistryItem;

    fn category_name(&self) -> &'static str {
        Category::Registry.as_str()
    }

    fn capture(
        &self,
        item: &RegistryItem,
        ctx: &ExtractContext<'_>,
    ) -> Result<ArtifactRecord, ItemError> {
        let rel = state_path(&item.common)?;
        let store = ctx.engine.registry.as_ref();
        let artifact = match item.kind {
            RegistryKind::Value => {
                let name = value_name(item)?;
                let current = store.read_value(&item.path, name)?;
                RegistryArtifact {
                    key_path: item.path.clone(),
                    value_name: Some(name.to_string()),
                    absent: current.is_none(),
                    values: current
                        .map(|d| KeyValues::from([(name.to_string(), d)]))
                        .unwrap_or_default(),
                }
            }
            RegistryKind::Key => {
                let current = store.read_key(&item.path)?;
                RegistryArtifact {
                    key_path: item.path.clone(),
                    value_name: None,
                    absent: current.is_none(),
                    values: current.unwrap_or_default(),
                }
            }
        };
        let bytes = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| ItemError::Parse(e.to_string()))?;
        let path = ctx.snapshot.artifact_path(Category::Registry, rel);
        write_artifact(&path, &bytes, item.common.encrypt, ctx.engine.vault.as_ref())?;
        if artifact.absent {
            ctx.engine
                .log
                .debug(&format!("{}: captured as absent", label(item)));
        }

        let mut record =
            ArtifactRecord::new(Category::Registry, &item.common.name, rel, item.common.encrypt);
        record.sha256 = Some(sha256_hex(&bytes));
        Ok(record)
    }

    fn apply(
        &self,
        item: &RegistryItem,
        record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Warning>, ItemError> {
        let store = ctx.engine.registry.as_ref();
        let Some(record) = record else {
            return apply_default(item, ctx);
        };

        let path = ctx.snapshot.artifact_path(Category::Registry, &record.path);
        let bytes = read_artifact(&path, record.encrypted, ctx.engine.vault.as_ref())?;
        let mut warnings = Vec::new();
        if let Some(expected) = &record.sha256
            && *expected != sha256_hex(&bytes)
        {
            warnings.push(Warning::new(
                Category::Registry.as_str(),
                label(item),
                format!("checksum mismatch for {}", path.display()),
            ));
        }
        let artifact: RegistryArtifact =
            serde_json::from_slice(&bytes).map_err(|e| ItemError::Parse(e.to_string()))?;
        let key = artifact.key_path.as_str();

        match (&artifact.value_name, artifact.absent) {
            (Some(name), true) => store.delete_value(key, name)?,
            (None, true) => store.delete_key(key)?,
            (Some(name), false) => {
                if let Some(data) = artifact.values.get(name) {
                    write_if_changed(store, key, name, data)?;
                }
            }
            (None, false) => {
                let current = store.read_key(key)?.unwrap_or_default();
                for (name, data) in &artifact.values {
                    if current.get(name) != Some(data) {
                        store.write_value(key, name, data)?;
                    }
                }
                for name in current.keys().filter(|n| !artifact.values.contains_key(*n)) {
                    store.delete_value(key, name)?;
                }
            }
        }
        Ok(warnings)
    }
}

/// Restore without a captured artifact: write the declared default.
fn apply_default(
    item: &RegistryItem,
    ctx: &ExtractContext<'_>,
) -> Result<Vec<Warning>, ItemError> {
    let (Some(default), RegistryKind::Value) = (&item.value_data, item.kind) else {
        return Err(ItemError::ArtifactMissing(label(item)));
    };
    let name = value_name(item)?;
    let data = RegistryData::from_template(item.value_kind, default).map_err(ItemError::Parse)?;
    write_if_changed(ctx.engine.registry.as_ref(), &item.path, name, &data)?;
    ctx.engine
        .log
        .debug(&format!("{}: wrote declared default", label(item)));
    Ok(Vec::new())
}

fn write_if_changed(
    store: &dyn RegistryStore,
    key: &str,
    name: &str,
    data: &RegistryData,
) -> Result<(), ItemError> {
    if store.read_value(key, name)?.as_ref() != Some(data) {
        store.write_value(key, name, data)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::test_support::test_context;
    use crate::snapshot::Snapshot;
    use std::collections::BTreeSet;

    fn item(yaml: &str) -> RegistryItem {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    const THEME: &str = "{name: Theme, action: backup, key_path: 'HKCU:\\Theme', type: value, value_name: Mode, dynamic_state_path: theme.json}";
    const KEY: &str = "{name: Console, action: backup, key_path: 'HKCU:\\Console', dynamic_state_path: console.json}";

    fn with_ctx(f: impl FnOnce(&ExtractContext<'_>)) {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_context();
        let snapshot = Snapshot::new(dir.path());
        let missing = BTreeSet::new();
        f(&ExtractContext {
            engine: &engine,
            snapshot: &snapshot,
            missing_prereqs: &missing,
        });
    }

    #[test]
    fn value_round_trip() {
        with_ctx(|ctx| {
            let store = ctx.engine.registry.as_ref();
            store.write_value("HKCU:\\Theme", "Mode", &RegistryData::Dword(1)).unwrap();
            let it = item(THEME);
            let record = RegistryExtractor.capture(&it, ctx).unwrap();

            store.write_value("HKCU:\\Theme", "Mode", &RegistryData::Dword(0)).unwrap();
            RegistryExtractor.apply(&it, Some(&record), ctx).unwrap();
            assert_eq!(
                store.read_value("HKCU:\\Theme", "Mode").unwrap(),
                Some(RegistryData::Dword(1))
            );
        });
    }

    #[test]
    fn absent_value_round_trips_as_deletion() {
        with_ctx(|ctx| {
            let store = ctx.engine.registry.as_ref();
            let it = item(THEME);
            let record = RegistryExtractor.capture(&it, ctx).unwrap();
            let doc: RegistryArtifact = serde_json::from_slice(
                &std::fs::read(ctx.snapshot.artifact_path(Category::Registry, "theme.json")).unwrap(),
            )
            .unwrap();
            assert!(doc.absent);

            store.write_value("HKCU:\\Theme", "Mode", &RegistryData::Dword(5)).unwrap();
            RegistryExtractor.apply(&it, Some(&record), ctx).unwrap();
            assert!(store.read_value("HKCU:\\Theme", "Mode").unwrap().is_none());
        });
    }

    #[test]
    fn key_capture_restores_exact_value_set() {
        with_ctx(|ctx| {
            let store = ctx.engine.registry.as_ref();
            store.write_value("HKCU:\\Console", "FontSize", &RegistryData::Dword(14)).unwrap();
            store
                .write_value("HKCU:\\Console", "Face", &RegistryData::String("Cascadia".into()))
                .unwrap();
            let it = item(KEY);
            let record = RegistryExtractor.capture(&it, ctx).unwrap();

            store.write_value("HKCU:\\Console", "FontSize", &RegistryData::Dword(20)).unwrap();
            store.write_value("HKCU:\\Console", "Extra", &RegistryData::Dword(1)).unwrap();
            RegistryExtractor.apply(&it, Some(&record), ctx).unwrap();

            let values = store.read_key("HKCU:\\Console").unwrap().unwrap();
            assert_eq!(values.len(), 2);
            assert_eq!(values["FontSize"], RegistryData::Dword(14));
        });
    }

    #[test]
    fn absent_key_is_deleted_on_apply() {
        with_ctx(|ctx| {
            let store = ctx.engine.registry.as_ref();
            let it = item(KEY);
            let record = RegistryExtractor.capture(&it, ctx).unwrap();
            store.write_value("HKCU:\\Console", "X", &RegistryData::Dword(1)).unwrap();
            RegistryExtractor.apply(&it, Some(&record), ctx).unwrap();
            assert!(store.read_key("HKCU:\\Console").unwrap().is_none());
        });
    }

    #[test]
    fn restore_without_artifact_writes_declared_default() {
        with_ctx(|ctx| {
            let it = item("{name: Theme, action: restore, key_path: 'HKCU:\\Theme', type: value, value_name: Mode, value_data: '0x2', value_kind: dword}");
            RegistryExtractor.apply(&it, None, ctx).unwrap();
            assert_eq!(
                ctx.engine.registry.read_value("HKCU:\\Theme", "Mode").unwrap(),
                Some(RegistryData::Dword(2))
            );

            let no_default = item(THEME);
            assert!(matches!(
                RegistryExtractor.apply(&no_default, None, ctx),
                Err(ItemError::ArtifactMissing(_))
            ));
        });
    }
}
