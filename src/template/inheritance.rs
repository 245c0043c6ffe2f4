//! Inheritance resolution: folds shared, machine-specific and conditional
//! sections into one [`EffectiveTemplate`].
//!
//! Layers are merged in a fixed order (top-level items, `shared`, then the
//! matching conditional and machine-specific sections) before inheritance
//! rules run over the result. Items merge when they share a category, a
//! name and the same set of tags.
use std::collections::BTreeSet;
use std::fmt;

use super::items::{Category, ConflictResolution, InheritancePolicy, Item, is_empty_value};
use super::model::{
    Configuration, FallbackStrategy, InheritanceMode, ItemLists, Metadata, PrerequisiteSpec,
    Stages, TEMPLATE_PRIORITY, Template, ValidationLevel,
};
use super::rules;
use super::selector::{self, HostProbe};
use crate::error::ResolveError;
use crate::warning::Warning;

const SOURCE: &str = "resolver";

/// Where an effective item (or its winning side) came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Top-level item list.
    Template,
    /// The `shared` section.
    Shared,
    /// A machine-specific block (label).
    Machine(String),
    /// A conditional section (name).
    Conditional(String),
}

impl Origin {
    /// Whether the origin is on the shared side of a conflict. Top-level
    /// items count as shared: they are the baseline every machine receives.
    #[must_use]
    pub const fn is_shared_side(&self) -> bool {
        matches!(self, Self::Template | Self::Shared)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template => f.write_str("template"),
            Self::Shared => f.write_str("shared"),
            Self::Machine(name) => write!(f, "machine:{name}"),
            Self::Conditional(name) => write!(f, "conditional:{name}"),
        }
    }
}

/// An item after inheritance, annotated with its origin and priority.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveItem {
    /// The merged item.
    pub item: Item,
    /// Origin of the winning side.
    pub origin: Origin,
    /// Resolved priority.
    pub priority: i64,
}

/// The template after inheritance: no sections, only effective items.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveTemplate {
    /// Template metadata.
    pub metadata: Metadata,
    /// Prerequisites, unchanged.
    pub prerequisites: Vec<PrerequisiteSpec>,
    /// Stages, unchanged.
    pub stages: Stages,
    /// Configuration used for resolution.
    pub configuration: Configuration,
    /// Items grouped by category (files, registry, applications), each
    /// group in merge order.
    pub items: Vec<EffectiveItem>,
}

impl EffectiveTemplate {
    /// Items of one category in order.
    pub fn items_in(&self, category: Category) -> impl Iterator<Item = &EffectiveItem> {
        self.items
            .iter()
            .filter(move |e| e.item.category() == category)
    }

    /// Look up an item by category and name.
    #[must_use]
    pub fn find(&self, category: Category, name: &str) -> Option<&EffectiveItem> {
        self.items_in(category).find(|e| e.item.name() == name)
    }
}

/// Output of [`resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The effective template.
    pub effective: EffectiveTemplate,
    /// Non-fatal findings.
    pub warnings: Vec<Warning>,
    /// Labels of the machine-specific and conditional sections that matched.
    pub matched_sections: Vec<String>,
}

/// Resolve `template` for the host behind `probe`.
///
/// # Errors
///
/// Returns [`ResolveError::NoMatchingSection`] under `fallback_strategy:
/// fail`, and [`ResolveError::MergeConflict`] or
/// [`ResolveError::RuleExecution`] under `validation_level: strict`.
pub fn resolve(template: &Template, probe: &dyn HostProbe) -> Result<Resolution, ResolveError> {
    let config = template.configuration;
    let mut merger = Merger {
        items: Vec::new(),
        warnings: Vec::new(),
        strict: config.validation_level == ValidationLevel::Strict,
    };

    merger.merge_layer(
        &template.items,
        &Origin::Template,
        TEMPLATE_PRIORITY,
        InheritancePolicy::Merge,
    )?;

    if config.inheritance_mode != InheritanceMode::MachineOnly
        && let Some(shared) = &template.shared
    {
        merger.merge_layer(
            &shared.items,
            &Origin::Shared,
            shared.priority,
            shared.override_policy,
        )?;
    }

    let mut matched_sections = Vec::new();
    if config.inheritance_mode != InheritanceMode::SharedOnly {
        let mut machine_layers = Vec::new();
        for (i, section) in template.machine_specific.iter().enumerate() {
            if selector::matches(&section.machine_selectors, probe) {
                let label = section.label(i);
                matched_sections.push(label.clone());
                machine_layers.push((
                    &section.items,
                    Origin::Machine(label),
                    section.priority,
                    section.merge_strategy,
                ));
            }
        }
        let mut conditional_layers = Vec::new();
        for section in &template.conditional_sections {
            if selector::conditions_hold(&section.conditions, section.logic, probe) {
                matched_sections.push(section.name.clone());
                conditional_layers.push((
                    &section.items,
                    Origin::Conditional(section.name.clone()),
                    section.priority,
                    InheritancePolicy::Merge,
                ));
            }
        }

        let layers = if config.machine_precedence {
            conditional_layers.into_iter().chain(machine_layers)
        } else {
            machine_layers.into_iter().chain(conditional_layers)
        };
        for (items, origin, priority, policy) in layers {
            merger.merge_layer(items, &origin, priority, policy)?;
        }

        let declares_sections =
            !template.machine_specific.is_empty() || !template.conditional_sections.is_empty();
        if declares_sections && matched_sections.is_empty() {
            match config.fallback_strategy {
                FallbackStrategy::UseShared => {}
                FallbackStrategy::Warn => merger.warnings.push(Warning::general(
                    SOURCE,
                    "no machine-specific or conditional section matched; using shared items",
                )),
                FallbackStrategy::Fail => return Err(ResolveError::NoMatchingSection),
            }
        }
    }

    let Merger {
        mut items,
        mut warnings,
        strict,
    } = merger;

    rules::apply_rules(
        &mut items,
        &template.inheritance_rules,
        probe,
        strict,
        &mut warnings,
    )?;

    items.sort_by_key(|e| e.item.category());

    Ok(Resolution {
        effective: EffectiveTemplate {
            metadata: template.metadata.clone(),
            prerequisites: template.prerequisites.clone(),
            stages: template.stages.clone(),
            configuration: config,
            items,
        },
        warnings,
        matched_sections,
    })
}

/// Merge identity: category, name and order-independent tag set.
fn merge_key(item: &Item) -> (Category, &str, BTreeSet<&str>) {
    (
        item.category(),
        item.name(),
        item.common()
            .inheritance_tags
            .iter()
            .map(String::as_str)
            .collect(),
    )
}

struct Merger {
    items: Vec<EffectiveItem>,
    warnings: Vec<Warning>,
    strict: bool,
}

impl Merger {
    fn merge_layer(
        &mut self,
        lists: &ItemLists,
        origin: &Origin,
        section_priority: i64,
        section_policy: InheritancePolicy,
    ) -> Result<(), ResolveError> {
        for item in lists.to_items() {
            let priority = item
                .common()
                .inheritance_priority
                .unwrap_or(section_priority);
            let policy = match item.common().inheritance_policy {
                InheritancePolicy::Merge => section_policy,
                explicit => explicit,
            };
            self.merge_one(
                EffectiveItem {
                    item,
                    origin: origin.clone(),
                    priority,
                },
                policy,
            )?;
        }
        Ok(())
    }

    fn merge_one(
        &mut self,
        incoming: EffectiveItem,
        policy: InheritancePolicy,
    ) -> Result<(), ResolveError> {
        let position = {
            let key = merge_key(&incoming.item);
            self.items.iter().position(|e| merge_key(&e.item) == key)
        };
        let Some(existing) = position.and_then(|i| self.items.get_mut(i)) else {
            self.items.push(incoming);
            return Ok(());
        };

        match policy {
            InheritancePolicy::Skip => {}
            InheritancePolicy::Replace => *existing = incoming,
            InheritancePolicy::Extend => {
                existing.item.union_lists(&incoming.item);
                existing.priority = existing.priority.max(incoming.priority);
            }
            InheritancePolicy::Merge => match combine(existing, &incoming) {
                Ok((merged, warning)) => {
                    *existing = merged;
                    self.warnings.extend(warning);
                }
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    self.warnings
                        .push(Warning::new(SOURCE, incoming.item.label(), e.to_string()));
                }
            },
        }
        Ok(())
    }
}

/// Resolve a conflict between two items sharing a merge key.
fn combine(
    existing: &EffectiveItem,
    incoming: &EffectiveItem,
) -> Result<(EffectiveItem, Option<Warning>), ResolveError> {
    let policy = incoming
        .item
        .common()
        .conflict_resolution
        .or(existing.item.common().conflict_resolution);

    let mut warning = None;
    let incoming_wins = match policy {
        None => match incoming.priority.cmp(&existing.priority) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => side_preference(existing, incoming, false),
        },
        Some(ConflictResolution::MachineWins | ConflictResolution::MergeBoth) => {
            side_preference(existing, incoming, false)
        }
        Some(ConflictResolution::Prompt) => {
            warning = Some(Warning::new(
                SOURCE,
                incoming.item.label(),
                "conflict_resolution 'prompt' is not supported unattended; using machine_wins",
            ));
            side_preference(existing, incoming, false)
        }
        Some(ConflictResolution::SharedWins) => side_preference(existing, incoming, true),
    };

    let (winner, loser) = if incoming_wins {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    let mut item = if policy == Some(ConflictResolution::MergeBoth) {
        merge_both(&winner.item, &loser.item)?
    } else {
        winner.item.clone()
    };
    item.union_lists(&loser.item);

    Ok((
        EffectiveItem {
            item,
            origin: winner.origin.clone(),
            priority: existing.priority.max(incoming.priority),
        },
        warning,
    ))
}

/// Whether `incoming` wins when one side is preferred: the shared side when
/// `prefer_shared`, otherwise the machine side. Items on the same side fall
/// back to priority, with ties going to the incoming item.
fn side_preference(existing: &EffectiveItem, incoming: &EffectiveItem, prefer_shared: bool) -> bool {
    let inc_shared = incoming.origin.is_shared_side();
    let ex_shared = existing.origin.is_shared_side();
    if inc_shared == ex_shared {
        incoming.priority >= existing.priority
    } else {
        inc_shared == prefer_shared
    }
}

/// Field-by-field union: the fields the winner's template wrote out, when
/// non-empty, override the loser's. Defaults never override.
fn merge_both(winner: &Item, loser: &Item) -> Result<Item, ResolveError> {
    if winner.category() != loser.category() || winner.type_tag() != loser.type_tag() {
        return Err(ResolveError::MergeConflict {
            item: winner.label(),
            reason: format!(
                "merge_both requires the same type ({} vs {})",
                winner.type_tag().unwrap_or("-"),
                loser.type_tag().unwrap_or("-")
            ),
        });
    }
    let explicit = &winner.common().explicit_fields;
    let mut fields = loser.to_fields();
    for (name, value) in winner.to_fields() {
        if explicit.contains(&name) && !is_empty_value(&value) {
            fields.insert(name, value);
        }
    }
    let mut merged = loser
        .with_fields(fields)
        .map_err(|e| ResolveError::MergeConflict {
            item: winner.label(),
            reason: e.to_string(),
        })?;
    merged
        .common_mut()
        .explicit_fields
        .extend(explicit.iter().cloned());
    Ok(merged)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::template::items::{FileItem, RegistryItem};
    use crate::template::parse;
    use crate::template::selector::test_probe::FakeProbe;

    fn resolve_yaml(yaml: &str, probe: &FakeProbe) -> Result<Resolution, ResolveError> {
        let template = parse(yaml.as_bytes()).expect("template parses");
        resolve(&template, probe)
    }

    fn registry(r: &Resolution, name: &str) -> (RegistryItem, EffectiveItem) {
        let e = r
            .effective
            .find(Category::Registry, name)
            .expect("item present")
            .clone();
        let Item::Registry(item) = e.item.clone() else {
            panic!("not a registry item");
        };
        (item, e)
    }

    const THEME: &str = r"
metadata: {name: theme}
shared:
  registry:
    - name: Theme
      action: backup
      key_path: 'HKCU:\Software\Theme'
      type: value
      value_name: Mode
      value_data: light
      dynamic_state_path: theme.json
machine_specific:
  - name: ws01
    machine_selectors:
      - {type: machine_name, value: WS01}
    priority: 90
    registry:
      - name: Theme
        action: backup
        key_path: 'HKCU:\Software\Theme'
        type: value
        value_name: Mode
        value_data: dark
        dynamic_state_path: theme.json
";

    #[test]
    fn theme_scenario_machine_block_wins() {
        let r = resolve_yaml(THEME, &FakeProbe::new("WS01")).unwrap();
        assert_eq!(r.effective.items.len(), 1);
        let (item, e) = registry(&r, "Theme");
        assert_eq!(item.value_data, Some(serde_json::Value::from("dark")));
        assert_eq!(e.priority, 90);
        assert_eq!(e.origin, Origin::Machine("ws01".to_string()));
        assert_eq!(r.matched_sections, vec!["ws01"]);
    }

    #[test]
    fn theme_scenario_other_machine_gets_shared() {
        let r = resolve_yaml(THEME, &FakeProbe::new("WS02")).unwrap();
        let (item, e) = registry(&r, "Theme");
        assert_eq!(item.value_data, Some(serde_json::Value::from("light")));
        assert_eq!(e.priority, 50);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn disjoint_keys_are_additive() {
        let yaml = "
metadata: {name: t}
files:
  - {name: A, action: restore, path: /a}
shared:
  files:
    - {name: B, action: restore, path: /b}
    - {name: A, action: restore, path: /a2, inheritance_tags: [x]}
machine_specific:
  - files:
      - {name: C, action: restore, path: /c}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        assert_eq!(r.effective.items.len(), 4);
    }

    #[test]
    fn tags_are_order_independent_in_merge_key() {
        let yaml = "
metadata: {name: t}
shared:
  files:
    - {name: A, action: restore, path: /shared, inheritance_tags: [a, b]}
machine_specific:
  - files:
      - {name: A, action: restore, path: /machine, inheritance_tags: [b, a]}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        assert_eq!(r.effective.items.len(), 1);
    }

    #[test]
    fn machine_wins_ignores_priority() {
        let yaml = "
metadata: {name: t}
shared:
  priority: 95
  files:
    - {name: A, action: restore, path: /shared, conflict_resolution: machine_wins}
machine_specific:
  - priority: 10
    files:
      - {name: A, action: restore, path: /machine, inheritance_tags: []}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let e = r.effective.find(Category::Files, "A").unwrap();
        let Item::File(FileItem { path, .. }) = &e.item else {
            panic!("not a file");
        };
        assert_eq!(path, "/machine");
        assert_eq!(e.priority, 95);
    }

    #[test]
    fn shared_wins_is_the_mirror() {
        let yaml = "
metadata: {name: t}
shared:
  files:
    - {name: A, action: restore, path: /shared}
machine_specific:
  - files:
      - {name: A, action: restore, path: /machine, conflict_resolution: shared_wins}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let Item::File(f) = &r.effective.find(Category::Files, "A").unwrap().item else {
            panic!("not a file");
        };
        assert_eq!(f.path, "/shared");
    }

    #[test]
    fn prompt_acts_as_machine_wins_with_warning() {
        let yaml = "
metadata: {name: t}
shared:
  priority: 99
  files:
    - {name: A, action: restore, path: /shared}
machine_specific:
  - files:
      - {name: A, action: restore, path: /machine, conflict_resolution: prompt}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let Item::File(f) = &r.effective.find(Category::Files, "A").unwrap().item else {
            panic!("not a file");
        };
        assert_eq!(f.path, "/machine");
        assert_eq!(r.warnings.len(), 1);
        assert!(r.warnings[0].message.contains("prompt"));
    }

    #[test]
    fn merge_both_fills_empty_fields_and_unions_lists() {
        let yaml = "
metadata: {name: t}
shared:
  registry:
    - name: R
      action: restore
      key_path: 'HKCU:\\App'
      type: value
      value_name: Level
      value_data: 3
machine_specific:
  - registry:
      - name: R
        action: restore
        key_path: 'HKCU:\\App'
        type: value
        value_name: Level
        encrypt: true
        conflict_resolution: merge_both
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let (item, _) = registry(&r, "R");
        assert_eq!(item.value_data, Some(serde_json::Value::from(3)));
        assert!(item.common.encrypt);
    }

    #[test]
    fn merge_both_keeps_written_values_over_defaults() {
        let yaml = "
metadata: {name: t}
shared:
  registry:
    - name: R
      action: restore
      key_path: 'HKCU:\\App'
      type: value
      value_name: Level
      value_kind: dword
      value_data: 3
      inheritance_policy: extend
machine_specific:
  - registry:
      - name: R
        action: restore
        key_path: 'HKCU:\\App'
        type: value
        value_name: Level
        conflict_resolution: merge_both
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let (item, _) = registry(&r, "R");
        assert_eq!(item.value_kind, crate::template::RegistryValueKind::Dword);
        assert_eq!(item.value_data, Some(serde_json::Value::from(3)));
        assert_eq!(item.common.inheritance_policy, InheritancePolicy::Extend);
    }

    #[test]
    fn merge_both_written_value_still_overrides() {
        let yaml = "
metadata: {name: t}
shared:
  registry:
    - {name: R, action: restore, key_path: 'HKCU:\\App', type: value, value_name: L, value_kind: dword}
machine_specific:
  - registry:
      - {name: R, action: restore, key_path: 'HKCU:\\App', type: value, value_name: L, value_kind: qword, conflict_resolution: merge_both}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let (item, _) = registry(&r, "R");
        assert_eq!(item.value_kind, crate::template::RegistryValueKind::Qword);
    }

    #[test]
    fn merge_both_type_mismatch_warns_or_fails_under_strict() {
        let body = "
shared:
  registry:
    - {name: R, action: restore, key_path: 'HKCU:\\App', type: key}
machine_specific:
  - registry:
      - {name: R, action: restore, key_path: 'HKCU:\\App', type: value, value_name: V, conflict_resolution: merge_both}
";
        let moderate = format!("metadata: {{name: t}}\n{body}");
        let r = resolve_yaml(&moderate, &FakeProbe::new("ANY")).unwrap();
        let (item, _) = registry(&r, "R");
        assert_eq!(item.kind, crate::template::RegistryKind::Key);
        assert_eq!(r.warnings.len(), 1);

        let strict =
            format!("metadata: {{name: t}}\nconfiguration: {{validation_level: strict}}\n{body}");
        assert!(matches!(
            resolve_yaml(&strict, &FakeProbe::new("ANY")),
            Err(ResolveError::MergeConflict { .. })
        ));
    }

    #[test]
    fn priority_decides_without_policy_and_ties_go_to_machine() {
        let yaml = "
metadata: {name: t}
shared:
  files:
    - {name: A, action: restore, path: /shared, inheritance_priority: 80}
    - {name: B, action: restore, path: /shared, inheritance_priority: 90}
machine_specific:
  - files:
      - {name: A, action: restore, path: /machine}
      - {name: B, action: restore, path: /machine}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let path = |name: &str| match &r.effective.find(Category::Files, name).unwrap().item {
            Item::File(f) => f.path.clone(),
            _ => String::new(),
        };
        assert_eq!(path("A"), "/machine");
        assert_eq!(path("B"), "/shared");
    }

    #[test]
    fn replace_and_skip_and_extend_strategies() {
        let yaml = "
metadata: {name: t}
shared:
  applications:
    - name: Tools
      action: backup
      discovery_command: list
      parse_procedure: builtin:lines
      install_procedure: install
      dependencies: [winget]
      dynamic_state_path: tools.json
    - {name: Kept, action: restore, discovery_command: a, parse_procedure: b, install_procedure: c}
machine_specific:
  - merge_strategy: append
    applications:
      - name: Tools
        action: restore
        discovery_command: other
        parse_procedure: other
        install_procedure: other
        dependencies: [choco]
      - name: Kept
        action: restore
        discovery_command: x
        parse_procedure: x
        install_procedure: x
        inheritance_policy: skip
";
        let r = resolve_yaml(yaml, &FakeProbe::new("ANY")).unwrap();
        let tools = r.effective.find(Category::Applications, "Tools").unwrap();
        let Item::Application(a) = &tools.item else {
            panic!("not an application");
        };
        assert_eq!(a.discovery_command, "list");
        assert_eq!(a.dependencies, vec!["winget", "choco"]);
        let Item::Application(k) = &r.effective.find(Category::Applications, "Kept").unwrap().item
        else {
            panic!("not an application");
        };
        assert_eq!(k.discovery_command, "a");
    }

    #[test]
    fn machine_precedence_orders_layers() {
        let body = "
conditional_sections:
  - name: devs
    conditions:
      - {type: environment_variable, name: ROLE, value: dev}
    priority: 80
    files:
      - {name: A, action: restore, path: /conditional}
machine_specific:
  - priority: 80
    files:
      - {name: A, action: restore, path: /machine}
";
        let probe = FakeProbe::new("ANY").with_env("ROLE", "dev");
        let path_of = |r: &Resolution| match &r.effective.find(Category::Files, "A").unwrap().item {
            Item::File(f) => f.path.clone(),
            _ => String::new(),
        };
        let r = resolve_yaml(&format!("metadata: {{name: t}}\n{body}"), &probe).unwrap();
        assert_eq!(path_of(&r), "/machine");
        let r = resolve_yaml(
            &format!("metadata: {{name: t}}\nconfiguration: {{machine_precedence: false}}\n{body}"),
            &probe,
        )
        .unwrap();
        assert_eq!(path_of(&r), "/conditional");
    }

    #[test]
    fn inheritance_modes() {
        let body = "
shared:
  files:
    - {name: S, action: restore, path: /s}
machine_specific:
  - files:
      - {name: M, action: restore, path: /m}
";
        let probe = FakeProbe::new("ANY");
        let names = |mode: &str| {
            let r = resolve_yaml(
                &format!(
                    "metadata: {{name: t}}\nconfiguration: {{inheritance_mode: {mode}}}\n{body}"
                ),
                &probe,
            )
            .unwrap();
            r.effective
                .items
                .iter()
                .map(|e| e.item.name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names("merged"), vec!["S", "M"]);
        assert_eq!(names("shared_only"), vec!["S"]);
        assert_eq!(names("machine_only"), vec!["M"]);
    }

    #[test]
    fn fallback_strategies() {
        let body = "
shared:
  files:
    - {name: S, action: restore, path: /s}
machine_specific:
  - machine_selectors:
      - {type: machine_name, value: NOPE}
    files:
      - {name: M, action: restore, path: /m}
";
        let probe = FakeProbe::new("WS01");
        let with = |strategy: &str| {
            resolve_yaml(
                &format!(
                    "metadata: {{name: t}}\nconfiguration: {{fallback_strategy: {strategy}}}\n{body}"
                ),
                &probe,
            )
        };
        let r = with("use_shared").unwrap();
        assert_eq!(r.effective.items.len(), 1);
        assert!(r.warnings.is_empty());
        assert_eq!(with("warn").unwrap().warnings.len(), 1);
        assert_eq!(
            with("fail").unwrap_err(),
            ResolveError::NoMatchingSection
        );
    }

    #[test]
    fn fallback_not_evaluated_without_sections() {
        let yaml = "metadata: {name: t}\nconfiguration: {fallback_strategy: fail}\nfiles:\n  - {name: A, action: restore, path: /a}\n";
        assert!(resolve_yaml(yaml, &FakeProbe::new("WS01")).is_ok());
    }

    #[test]
    fn items_are_grouped_by_category() {
        let yaml = "
metadata: {name: t}
applications:
  - {name: P, action: restore, discovery_command: a, parse_procedure: b, install_procedure: c}
registry:
  - {name: R, action: restore, key_path: 'HKCU:\\R'}
files:
  - {name: F, action: restore, path: /f}
";
        let r = resolve_yaml(yaml, &FakeProbe::new("WS01")).unwrap();
        let cats: Vec<_> = r.effective.items.iter().map(|e| e.item.category()).collect();
        assert_eq!(
            cats,
            vec![Category::Files, Category::Registry, Category::Applications]
        );
    }
}
