//! Typed template document.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use super::items::{
    ApplicationItem, Category, FileItem, InheritancePolicy, Item, RegistryItem, opt_scalar_string,
};
use super::selector::MachineSelector;

/// Default priority of top-level items.
pub const TEMPLATE_PRIORITY: i64 = 0;
/// Default priority of the `shared` section.
pub const SHARED_PRIORITY: i64 = 50;
/// Default priority of `machine_specific` blocks.
pub const MACHINE_PRIORITY: i64 = 80;
/// Default priority of `conditional_sections`.
pub const CONDITIONAL_PRIORITY: i64 = 70;

/// A parsed, pre-inheritance template. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Template {
    /// Informational metadata.
    pub metadata: Metadata,
    /// Checks evaluated before any item is touched.
    #[serde(default)]
    pub prerequisites: Vec<PrerequisiteSpec>,
    /// Top-level items.
    #[serde(flatten)]
    pub items: ItemLists,
    /// Hook scripts at the four lifecycle points.
    #[serde(default)]
    pub stages: Stages,
    /// Inheritance behaviour.
    #[serde(default)]
    pub configuration: Configuration,
    /// Items shared by every machine.
    #[serde(default)]
    pub shared: Option<SharedSection>,
    /// Per-machine overrides.
    #[serde(default)]
    pub machine_specific: Vec<MachineSection>,
    /// Post-merge rules.
    #[serde(default)]
    pub inheritance_rules: Vec<InheritanceRule>,
    /// Sections applied when their conditions hold.
    #[serde(default)]
    pub conditional_sections: Vec<ConditionalSection>,
}

/// Template metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Metadata {
    /// Template name (required).
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Template version.
    #[serde(default, deserialize_with = "opt_scalar_string")]
    pub version: Option<String>,
    /// Author.
    #[serde(default)]
    pub author: Option<String>,
}

/// The three ordered item lists carried by the template and every section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ItemLists {
    /// File items.
    #[serde(default)]
    pub files: Vec<FileItem>,
    /// Registry items.
    #[serde(default)]
    pub registry: Vec<RegistryItem>,
    /// Application items.
    #[serde(default)]
    pub applications: Vec<ApplicationItem>,
}

impl ItemLists {
    /// All items, files first, each list in declared order.
    #[must_use]
    pub fn to_items(&self) -> Vec<Item> {
        self.files
            .iter()
            .cloned()
            .map(Item::File)
            .chain(self.registry.iter().cloned().map(Item::Registry))
            .chain(self.applications.iter().cloned().map(Item::Application))
            .collect()
    }

    /// Whether every list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.registry.is_empty() && self.applications.is_empty()
    }

    /// `(category, name, dynamic_state_path)` of every item, for validation.
    pub(crate) fn state_paths(&self) -> Vec<(Category, &str, Option<&str>)> {
        let common = self
            .files
            .iter()
            .map(|i| (Category::Files, &i.common))
            .chain(self.registry.iter().map(|i| (Category::Registry, &i.common)))
            .chain(
                self.applications
                    .iter()
                    .map(|i| (Category::Applications, &i.common)),
            );
        common
            .map(|(c, i)| (c, i.name.as_str(), i.dynamic_state_path.as_deref()))
            .collect()
    }
}

/// How shared and machine sections are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceMode {
    /// Shared, machine-specific and conditional sections are all merged.
    #[default]
    Merged,
    /// Only top-level and shared items.
    SharedOnly,
    /// Top-level, machine-specific and conditional items; `shared` ignored.
    MachineOnly,
}

/// How strictly resolver problems are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Merge conflicts and rule failures abort resolution.
    Strict,
    /// Merge conflicts and rule failures become warnings.
    #[default]
    Moderate,
    /// Same as moderate.
    Relaxed,
}

/// What to do when no machine or conditional section matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Accept the shared result silently.
    #[default]
    UseShared,
    /// Abort resolution.
    Fail,
    /// Accept the shared result with a warning.
    Warn,
}

/// Template-level inheritance settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Which sections participate.
    pub inheritance_mode: InheritanceMode,
    /// Merge machine-specific blocks after conditional sections.
    pub machine_precedence: bool,
    /// Strictness for merge and rule problems.
    pub validation_level: ValidationLevel,
    /// Behaviour when no section matched.
    pub fallback_strategy: FallbackStrategy,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            inheritance_mode: InheritanceMode::default(),
            machine_precedence: true,
            validation_level: ValidationLevel::default(),
            fallback_strategy: FallbackStrategy::default(),
        }
    }
}

/// Items shared by all machines.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SharedSection {
    /// Default priority of shared items.
    #[serde(default = "default_shared_priority")]
    pub priority: i64,
    /// Strategy for items colliding with top-level items.
    #[serde(default)]
    pub override_policy: InheritancePolicy,
    /// Shared items.
    #[serde(flatten)]
    pub items: ItemLists,
}

/// Items applied to machines matching any selector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MachineSection {
    /// Optional label used in logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Selectors (ORed; empty matches every machine).
    #[serde(default)]
    pub machine_selectors: Vec<MachineSelector>,
    /// Default priority of this block's items.
    #[serde(default = "default_machine_priority")]
    pub priority: i64,
    /// Strategy for colliding items (`append` is accepted for `extend`).
    #[serde(default)]
    pub merge_strategy: InheritancePolicy,
    /// Machine-specific items.
    #[serde(flatten)]
    pub items: ItemLists,
}

impl MachineSection {
    /// Label for logs: the name, or `machine_specific[<index>]`.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("machine_specific[{index}]"))
    }
}

/// How conditions of a conditional section combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    /// Every condition must hold.
    #[default]
    And,
    /// At least one condition must hold.
    Or,
    /// No condition may hold.
    Not,
}

/// Items applied when a combination of selectors holds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConditionalSection {
    /// Section name.
    #[serde(default)]
    pub name: String,
    /// Conditions, evaluated with the selector evaluator.
    #[serde(default)]
    pub conditions: Vec<MachineSelector>,
    /// Combination logic.
    #[serde(default)]
    pub logic: ConditionLogic,
    /// Default priority of this section's items.
    #[serde(default = "default_conditional_priority")]
    pub priority: i64,
    /// Conditional items.
    #[serde(flatten)]
    pub items: ItemLists,
}

/// Rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Fill empty fields from parameters.
    Merge,
    /// Overwrite fields from parameters.
    Replace,
    /// Remove the item.
    Skip,
    /// Check the item; failures warn or abort per validation level.
    Validate,
    /// Replace fields with the output of the rule script.
    Transform,
}

/// Whether all or any of the rule's tags must be present on the item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    /// At least one tag.
    #[default]
    Any,
    /// Every tag.
    All,
}

/// Which items a rule applies to. Every present clause must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    /// Required tags.
    pub inheritance_tags: Vec<String>,
    /// Tag combination.
    pub tag_match: TagMatch,
    /// Regex tested against the item name.
    pub name_pattern: Option<String>,
    /// Host selectors (ORed).
    pub machine_selectors: Vec<MachineSelector>,
}

/// A rule applied to merged items in declared order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InheritanceRule {
    /// Rule name.
    #[serde(default)]
    pub name: String,
    /// Categories the rule applies to (all when empty).
    #[serde(default)]
    pub applies_to: Vec<Category>,
    /// Item filter.
    #[serde(default)]
    pub condition: RuleCondition,
    /// What the rule does.
    pub action: RuleAction,
    /// Field values or action options.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Script for `transform` and `validate`.
    #[serde(default)]
    pub script: Option<String>,
}

impl InheritanceRule {
    /// Whether the rule covers `category`.
    #[must_use]
    pub fn applies_to_category(&self, category: Category) -> bool {
        self.applies_to.is_empty() || self.applies_to.contains(&category)
    }
}

/// Prerequisite check type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrerequisiteKind {
    /// A command on `PATH` with matching output.
    Application,
    /// A registry-equivalent value.
    Registry,
    /// An inline script with matching output.
    Script,
}

/// Policy when a prerequisite is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Warn and continue.
    #[default]
    Warn,
    /// Abort Backup runs.
    FailBackup,
    /// Abort Restore runs.
    FailRestore,
}

/// A declared prerequisite.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrerequisiteSpec {
    /// Check type.
    #[serde(rename = "type")]
    pub kind: PrerequisiteKind,
    /// Name, referenced by application `dependencies`.
    #[serde(default)]
    pub name: String,
    /// Missing policy.
    #[serde(default)]
    pub on_missing: OnMissing,
    /// Command line for `application` checks.
    #[serde(default)]
    pub check_command: Option<String>,
    /// Regex tested against command or script output.
    #[serde(default)]
    pub expected_output: Option<String>,
    /// Key for `registry` checks.
    #[serde(default)]
    pub key_path: Option<String>,
    /// Value name for `registry` checks.
    #[serde(default)]
    pub value_name: Option<String>,
    /// Expected value data for `registry` checks.
    #[serde(default, deserialize_with = "opt_scalar_string")]
    pub expected_value: Option<String>,
    /// Script body for `script` checks.
    #[serde(default)]
    pub script: Option<String>,
}

/// The four lifecycle hook lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Stages {
    /// Before anything is touched; failures may abort.
    pub prereqs: Vec<StageItemSpec>,
    /// Before items are processed.
    pub pre_update: Vec<StageItemSpec>,
    /// After items are processed.
    pub post_update: Vec<StageItemSpec>,
    /// Always last.
    pub cleanup: Vec<StageItemSpec>,
}

/// Stage item type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageItemKind {
    /// Run a script; non-zero exit is a failure.
    #[default]
    Script,
    /// Run a script and match its output.
    Check,
}

/// A single hook script or check.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageItemSpec {
    /// Item name.
    #[serde(default)]
    pub name: String,
    /// Script or check.
    #[serde(rename = "type", default)]
    pub kind: StageItemKind,
    /// Inline script body.
    #[serde(default)]
    pub script: Option<String>,
    /// Script file.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Parameters exported to the script environment.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Regex the output must match (checks only).
    #[serde(default)]
    pub expected_output: Option<String>,
}

const fn default_shared_priority() -> i64 {
    SHARED_PRIORITY
}

const fn default_machine_priority() -> i64 {
    MACHINE_PRIORITY
}

const fn default_conditional_priority() -> i64 {
    CONDITIONAL_PRIORITY
}
