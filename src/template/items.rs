//! Item specifications: the files, registry entries and application
//! inventories a template declares.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::engine::OperationKind;

/// The three item categories. Processing order follows declaration order
/// of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// File and directory items.
    Files,
    /// Registry-equivalent keys and values.
    Registry,
    /// Installed-application inventories.
    Applications,
}

impl Category {
    /// All categories in processing order.
    pub const ALL: [Self; 3] = [Self::Files, Self::Registry, Self::Applications];

    /// Name used in templates and as the snapshot subdirectory.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Registry => "registry",
            Self::Applications => "applications",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an item participates in an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Captured by Backup, applied by Restore.
    Backup,
    /// Only applied by Restore.
    Restore,
    /// Captured by Backup and Sync, applied by Restore.
    Sync,
}

impl Action {
    /// Name as written in templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Sync => "sync",
        }
    }

    /// Whether this action captures state.
    #[must_use]
    pub const fn captures(self) -> bool {
        matches!(self, Self::Backup | Self::Sync)
    }

    /// Whether an item with this action is captured by `operation`.
    #[must_use]
    pub const fn captured_by(self, operation: OperationKind) -> bool {
        match operation {
            OperationKind::Backup => self.captures(),
            OperationKind::Sync => matches!(self, Self::Sync),
            OperationKind::Restore | OperationKind::Uninstall => false,
        }
    }
}

/// How an incoming item combines with an existing one during inheritance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritancePolicy {
    /// Resolve scalar conflicts; union lists.
    #[default]
    Merge,
    /// Replace the existing item wholesale.
    Replace,
    /// Union only list-valued fields into the existing item.
    #[serde(alias = "append")]
    Extend,
    /// Ignore the incoming item when it collides.
    Skip,
}

/// Which side wins scalar-field conflicts for a merged item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// The non-shared-origin item's scalars win.
    MachineWins,
    /// The shared-origin item's scalars win.
    SharedWins,
    /// Field-by-field union of compatible items.
    MergeBoth,
    /// Interactive choice; treated as `machine_wins` unattended.
    Prompt,
}

/// Fields shared by every item category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCommon {
    /// Human label; part of the merge key.
    #[serde(default)]
    pub name: String,
    /// Participation in operations.
    pub action: Action,
    /// Store the artifact encrypted.
    #[serde(default)]
    pub encrypt: bool,
    /// Relative location of the artifact inside its category directory.
    #[serde(default)]
    pub dynamic_state_path: Option<String>,
    /// Tags; part of the merge key.
    #[serde(default)]
    pub inheritance_tags: Vec<String>,
    /// Explicit priority; defaults to the containing section's priority.
    #[serde(default)]
    pub inheritance_priority: Option<i64>,
    /// Per-item merge policy.
    #[serde(default)]
    pub inheritance_policy: InheritancePolicy,
    /// Per-item conflict policy.
    #[serde(default)]
    pub conflict_resolution: Option<ConflictResolution>,
    /// Serialized names of the fields the template wrote out for this item.
    /// Everything else holds its default.
    #[serde(skip)]
    pub explicit_fields: BTreeSet<String>,
}

/// Whether a file item names a single file or a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// A single file.
    #[default]
    File,
    /// A directory, captured recursively.
    Directory,
}

/// Checksum recorded for captured files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    /// SHA-256 of the plaintext bytes.
    #[default]
    Sha256,
    /// No checksum.
    None,
}

/// A file or directory to capture and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    /// Common item fields.
    #[serde(flatten)]
    pub common: ItemCommon,
    /// Source path on the host (`~` and environment references expand).
    #[serde(default, alias = "source_path")]
    pub path: String,
    /// File or directory.
    #[serde(rename = "type", default)]
    pub kind: FileKind,
    /// Restore target when different from `path`.
    #[serde(default)]
    pub destination: Option<String>,
    /// Checksum recorded on capture and verified on apply.
    #[serde(default)]
    pub checksum_type: ChecksumType,
    /// A checksum mismatch on apply fails the item instead of warning.
    #[serde(default)]
    pub verify: bool,
    /// A missing source skips the item instead of failing it.
    #[serde(default)]
    pub optional: bool,
}

/// Whether a registry item covers a whole key or one value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    /// Every value under the key.
    #[default]
    Key,
    /// A single named value.
    Value,
}

/// Data type of a registry-equivalent value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryValueKind {
    /// `REG_SZ`.
    #[default]
    String,
    /// `REG_EXPAND_SZ`.
    ExpandString,
    /// `REG_DWORD`.
    Dword,
    /// `REG_QWORD`.
    Qword,
    /// `REG_BINARY`.
    Binary,
    /// `REG_MULTI_SZ`.
    MultiString,
}

/// A registry-equivalent key or value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryItem {
    /// Common item fields.
    #[serde(flatten)]
    pub common: ItemCommon,
    /// Key path, e.g. `HKCU:\Software\Example`.
    #[serde(default, alias = "key_path")]
    pub path: String,
    /// Key or value.
    #[serde(rename = "type", default)]
    pub kind: RegistryKind,
    /// Value name (required for `type: value`).
    #[serde(default)]
    pub value_name: Option<String>,
    /// Default data written on restore when nothing was captured.
    #[serde(default)]
    pub value_data: Option<Value>,
    /// Data type used when writing `value_data`.
    #[serde(default)]
    pub value_kind: RegistryValueKind,
}

/// An installed-application inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationItem {
    /// Common item fields.
    #[serde(flatten)]
    pub common: ItemCommon,
    /// Informational package manager label (`winget`, `apt`, ...).
    #[serde(default)]
    pub package_manager: String,
    /// Command that lists installed packages.
    #[serde(default)]
    pub discovery_command: String,
    /// Script or `builtin:*` parser turning discovery output into JSON.
    #[serde(default)]
    pub parse_procedure: String,
    /// Script run once per package to install.
    #[serde(default)]
    pub install_procedure: String,
    /// Script run once per package to uninstall.
    #[serde(default)]
    pub uninstall_procedure: Option<String>,
    /// Prerequisite names this inventory depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// An item of any category (closed set).
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// File item.
    File(FileItem),
    /// Registry item.
    Registry(RegistryItem),
    /// Application item.
    Application(ApplicationItem),
}

/// Errors from reading or writing item fields by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// The item has no field of that name.
    Unknown(String),
    /// The value does not fit the field's type.
    Invalid {
        /// Field name.
        field: String,
        /// Deserialization error.
        reason: String,
    },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(field) => write!(f, "unknown field '{field}'"),
            Self::Invalid { field, reason } => write!(f, "invalid value for '{field}': {reason}"),
        }
    }
}

impl Item {
    /// Category of this item.
    #[must_use]
    pub const fn category(&self) -> Category {
        match self {
            Self::File(_) => Category::Files,
            Self::Registry(_) => Category::Registry,
            Self::Application(_) => Category::Applications,
        }
    }

    /// Common fields.
    #[must_use]
    pub const fn common(&self) -> &ItemCommon {
        match self {
            Self::File(i) => &i.common,
            Self::Registry(i) => &i.common,
            Self::Application(i) => &i.common,
        }
    }

    /// Mutable common fields.
    pub fn common_mut(&mut self) -> &mut ItemCommon {
        match self {
            Self::File(i) => &mut i.common,
            Self::Registry(i) => &mut i.common,
            Self::Application(i) => &mut i.common,
        }
    }

    /// Item name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// `<category>/<name>`, used in reports and logs.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.category(), self.name())
    }

    /// The category-specific `type` tag, used for `merge_both`
    /// compatibility. Applications have none.
    #[must_use]
    pub const fn type_tag(&self) -> Option<&'static str> {
        match self {
            Self::File(i) => Some(match i.kind {
                FileKind::File => "file",
                FileKind::Directory => "directory",
            }),
            Self::Registry(i) => Some(match i.kind {
                RegistryKind::Key => "key",
                RegistryKind::Value => "value",
            }),
            Self::Application(_) => None,
        }
    }

    /// List-valued fields (unioned on merge).
    #[must_use]
    pub fn list_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Application(_) => &["inheritance_tags", "dependencies"],
            Self::File(_) | Self::Registry(_) => &["inheritance_tags"],
        }
    }

    /// Union the list-valued fields of `other` into `self`, keeping the
    /// order of first appearance.
    pub fn union_lists(&mut self, other: &Self) {
        union_into(
            &mut self.common_mut().inheritance_tags,
            &other.common().inheritance_tags,
        );
        if let (Self::Application(a), Self::Application(b)) = (self, other) {
            union_into(&mut a.dependencies, &b.dependencies);
        }
    }

    /// Serialize the item to a flat field map.
    #[must_use]
    pub fn to_fields(&self) -> Map<String, Value> {
        let value = match self {
            Self::File(i) => serde_json::to_value(i),
            Self::Registry(i) => serde_json::to_value(i),
            Self::Application(i) => serde_json::to_value(i),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Rebuild an item of the same category from a field map.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::Invalid`] when a field has the wrong type.
    pub fn with_fields(&self, fields: Map<String, Value>) -> Result<Self, FieldError> {
        let value = Value::Object(fields);
        let invalid = |e: serde_json::Error| FieldError::Invalid {
            field: "item".to_string(),
            reason: e.to_string(),
        };
        let mut item = match self {
            Self::File(_) => Self::File(serde_json::from_value(value).map_err(invalid)?),
            Self::Registry(_) => Self::Registry(serde_json::from_value(value).map_err(invalid)?),
            Self::Application(_) => {
                Self::Application(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        item.common_mut()
            .explicit_fields
            .clone_from(&self.common().explicit_fields);
        Ok(item)
    }

    /// Read a field by name, resolving aliases.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::Unknown`] if the item has no such field.
    pub fn field(&self, name: &str) -> Result<Value, FieldError> {
        let fields = self.to_fields();
        fields
            .get(canonical_field(name))
            .cloned()
            .ok_or_else(|| FieldError::Unknown(name.to_string()))
    }

    /// Set several fields at once. Either every field is applied or the
    /// item is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] for unknown field names and mistyped values.
    pub fn set_fields(&mut self, updates: &BTreeMap<String, Value>) -> Result<(), FieldError> {
        let mut fields = self.to_fields();
        for (name, value) in updates {
            let key = canonical_field(name);
            let Some(slot) = fields.get_mut(key) else {
                return Err(FieldError::Unknown(name.clone()));
            };
            *slot = coerce_like(slot, value.clone());
        }
        let updated = self.with_fields(fields).map_err(|e| match e {
            FieldError::Invalid { reason, .. } => FieldError::Invalid {
                field: updates.keys().cloned().collect::<Vec<_>>().join(","),
                reason,
            },
            other @ FieldError::Unknown(_) => other,
        })?;
        *self = updated;
        let explicit = &mut self.common_mut().explicit_fields;
        explicit.extend(updates.keys().map(|k| canonical_field(k).to_string()));
        Ok(())
    }

    /// Field values rendered as strings, for exporting to scripts.
    #[must_use]
    pub fn field_strings(&self) -> BTreeMap<String, String> {
        self.to_fields()
            .into_iter()
            .map(|(k, v)| (k, value_to_string(&v)))
            .collect()
    }
}

/// Map field aliases accepted in templates onto serialized names.
pub(crate) fn canonical_field(name: &str) -> &str {
    match name {
        "source_path" | "key_path" => "path",
        other => other,
    }
}

/// Bring a string value into the shape of the existing field so that rule
/// parameters and script output can set booleans, numbers and lists.
fn coerce_like(existing: &Value, incoming: Value) -> Value {
    let Value::String(s) = &incoming else {
        return incoming;
    };
    match existing {
        Value::Bool(_) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => incoming,
        },
        Value::Number(_) => s
            .trim()
            .parse::<i64>()
            .map_or(incoming, |n| Value::Number(n.into())),
        Value::Array(_) => Value::Array(
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| Value::String(p.to_string()))
                .collect(),
        ),
        _ => incoming,
    }
}

/// Whether a field value counts as empty for `merge` fills and
/// `merge_both` unions.
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) | Value::Bool(true) => false,
    }
}

/// Render a JSON value as a plain string (strings unquoted).
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for value in extra {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

/// Scalar YAML value accepted where a string is expected.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<Scalar> for String {
    fn from(s: Scalar) -> Self {
        match s {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

/// Deserialize a string that may be written as a bare number or boolean.
pub(crate) fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Scalar::deserialize(d).map(String::from)
}

/// Optional variant of [`scalar_string`].
pub(crate) fn opt_scalar_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<String>, D::Error> {
    Option::<Scalar>::deserialize(d).map(|o| o.map(String::from))
}
