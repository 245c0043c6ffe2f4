//! Declarative templates: model, parsing, host selectors and inheritance.
pub mod inheritance;
pub mod items;
pub mod model;
pub mod rules;
pub mod selector;
pub mod validation;

use std::path::Path;

pub use inheritance::{EffectiveItem, EffectiveTemplate, Origin, Resolution, resolve};
pub use items::{
    Action, ApplicationItem, Category, ChecksumType, ConflictResolution, FileItem, FileKind,
    InheritancePolicy, Item, ItemCommon, RegistryItem, RegistryKind, RegistryValueKind,
};
pub use model::{
    Configuration, OnMissing, PrerequisiteKind, PrerequisiteSpec, StageItemKind, StageItemSpec,
    Stages, Template,
};
pub use selector::{HostProbe, MachineSelector, Operator, SelectorKind};

use crate::error::SchemaError;

/// Parse a template document.
///
/// Unknown keys are ignored. Every missing required field and semantic
/// violation is reported together in [`SchemaError::Invalid`].
///
/// # Errors
///
/// Returns [`SchemaError::Malformed`] for YAML syntax errors, wrong value
/// types and unknown enum values, and [`SchemaError::Invalid`] for schema
/// violations.
pub fn parse(bytes: &[u8]) -> Result<Template, SchemaError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SchemaError::Malformed(format!("template is not UTF-8: {e}")))?;

    let raw: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(text).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    if !raw.is_mapping() {
        return Err(SchemaError::Malformed(
            "template root must be a mapping".to_string(),
        ));
    }
    let missing = validation::required_fields(&raw);
    if !missing.is_empty() {
        return Err(SchemaError::Invalid(missing));
    }

    let mut template: Template =
        serde_yaml_ng::from_str(text).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    record_explicit_fields(&mut template, &raw);
    let violations = validation::validate(&template);
    if !violations.is_empty() {
        return Err(SchemaError::Invalid(violations));
    }
    Ok(template)
}

/// Note which keys each item spelled out, so merging can tell a written
/// value from a serde default.
fn record_explicit_fields(template: &mut Template, raw: &serde_yaml_ng::Value) {
    mark_lists(&mut template.items, Some(raw));
    if let Some(shared) = &mut template.shared {
        mark_lists(&mut shared.items, raw.get("shared"));
    }
    let machines = raw
        .get("machine_specific")
        .and_then(serde_yaml_ng::Value::as_sequence);
    for (i, section) in template.machine_specific.iter_mut().enumerate() {
        mark_lists(&mut section.items, machines.and_then(|s| s.get(i)));
    }
    let conditionals = raw
        .get("conditional_sections")
        .and_then(serde_yaml_ng::Value::as_sequence);
    for (i, section) in template.conditional_sections.iter_mut().enumerate() {
        mark_lists(&mut section.items, conditionals.and_then(|s| s.get(i)));
    }
}

fn mark_lists(lists: &mut model::ItemLists, raw: Option<&serde_yaml_ng::Value>) {
    let Some(raw) = raw else { return };
    mark_items(lists.files.iter_mut().map(|i| &mut i.common), raw.get("files"));
    mark_items(
        lists.registry.iter_mut().map(|i| &mut i.common),
        raw.get("registry"),
    );
    mark_items(
        lists.applications.iter_mut().map(|i| &mut i.common),
        raw.get("applications"),
    );
}

fn mark_items<'a>(
    commons: impl Iterator<Item = &'a mut ItemCommon>,
    raw: Option<&serde_yaml_ng::Value>,
) {
    let Some(entries) = raw.and_then(serde_yaml_ng::Value::as_sequence) else {
        return;
    };
    for (common, entry) in commons.zip(entries) {
        if let Some(mapping) = entry.as_mapping() {
            common.explicit_fields = mapping
                .keys()
                .filter_map(serde_yaml_ng::Value::as_str)
                .map(|k| items::canonical_field(k).to_string())
                .collect();
        }
    }
}

/// Read and parse a template file.
///
/// # Errors
///
/// Returns [`SchemaError::Read`] if the file cannot be read, otherwise as
/// [`parse`].
pub fn load(path: &Path) -> Result<Template, SchemaError> {
    let bytes = std::fs::read(path).map_err(|source| SchemaError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&bytes)
}
