//! Schema validation for template documents.
//!
//! Two passes: [`required_fields`] walks the raw YAML tree so that every
//! missing field is reported at once (typed deserialization stops at the
//! first), and [`validate`] checks the typed template for semantic
//! problems such as duplicate state paths and malformed regexes.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use regex::Regex;
use serde_yaml_ng::Value;

use super::items::Category;
use super::model::{ItemLists, Template};

/// Report every required field missing from the raw document.
#[must_use]
pub fn required_fields(doc: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    if missing(doc.get("metadata"), "name") {
        errors.push("metadata.name is required".to_string());
    }

    check_item_lists(doc, "", &mut errors);
    if let Some(shared) = doc.get("shared").filter(|v| v.is_mapping()) {
        check_item_lists(shared, "shared.", &mut errors);
    }
    for (i, section) in sequence(doc.get("machine_specific")) {
        check_item_lists(section, &format!("machine_specific[{i}]."), &mut errors);
    }
    for (i, section) in sequence(doc.get("conditional_sections")) {
        if missing(Some(section), "name") {
            errors.push(format!("conditional_sections[{i}].name is required"));
        }
        check_item_lists(section, &format!("conditional_sections[{i}]."), &mut errors);
    }

    for (i, rule) in sequence(doc.get("inheritance_rules")) {
        for field in ["name", "action"] {
            if missing(Some(rule), field) {
                errors.push(format!("inheritance_rules[{i}].{field} is required"));
            }
        }
    }

    for (i, prereq) in sequence(doc.get("prerequisites")) {
        let at = format!("prerequisites[{i}]");
        for field in ["type", "name"] {
            if missing(Some(prereq), field) {
                errors.push(format!("{at}.{field} is required"));
            }
        }
        let needed = match prereq.get("type").and_then(Value::as_str) {
            Some("application") => Some("check_command"),
            Some("registry") => Some("key_path"),
            Some("script") => Some("script"),
            _ => None,
        };
        if let Some(field) = needed
            && missing(Some(prereq), field)
        {
            errors.push(format!("{at}.{field} is required"));
        }
    }

    if let Some(stages) = doc.get("stages") {
        for stage in ["prereqs", "pre_update", "post_update", "cleanup"] {
            for (i, item) in sequence(stages.get(stage)) {
                let at = format!("stages.{stage}[{i}]");
                if missing(Some(item), "name") {
                    errors.push(format!("{at}.name is required"));
                }
                if missing(Some(item), "script") && missing(Some(item), "path") {
                    errors.push(format!("{at} requires script or path"));
                }
            }
        }
    }

    errors
}

fn check_item_lists(section: &Value, prefix: &str, errors: &mut Vec<String>) {
    for category in Category::ALL {
        for (i, item) in sequence(section.get(category.as_str())) {
            let at = format!("{prefix}{category}[{i}]");
            for field in ["name", "action"] {
                if missing(Some(item), field) {
                    errors.push(format!("{at}.{field} is required"));
                }
            }
            match category {
                Category::Files => {
                    if missing(Some(item), "path") && missing(Some(item), "source_path") {
                        errors.push(format!("{at}.path is required"));
                    }
                }
                Category::Registry => {
                    if missing(Some(item), "path") && missing(Some(item), "key_path") {
                        errors.push(format!("{at}.path is required"));
                    }
                    let is_value = item.get("type").and_then(Value::as_str) == Some("value");
                    if is_value && missing(Some(item), "value_name") {
                        errors.push(format!("{at}.value_name is required for type value"));
                    }
                }
                Category::Applications => {
                    for field in ["discovery_command", "parse_procedure", "install_procedure"] {
                        if missing(Some(item), field) {
                            errors.push(format!("{at}.{field} is required"));
                        }
                    }
                }
            }
        }
    }
}

fn missing(parent: Option<&Value>, field: &str) -> bool {
    match parent.and_then(|p| p.get(field)) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn sequence(value: Option<&Value>) -> impl Iterator<Item = (usize, &Value)> {
    value
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .enumerate()
}

/// Semantic checks on a typed template.
#[must_use]
pub fn validate(template: &Template) -> Vec<String> {
    let mut errors = Vec::new();

    let mut sections: Vec<(String, &ItemLists)> = vec![(String::new(), &template.items)];
    if let Some(shared) = &template.shared {
        sections.push(("shared.".to_string(), &shared.items));
    }
    for (i, m) in template.machine_specific.iter().enumerate() {
        sections.push((format!("machine_specific[{i}]."), &m.items));
    }
    for (i, c) in template.conditional_sections.iter().enumerate() {
        sections.push((format!("conditional_sections[{i}]."), &c.items));
    }
    check_state_paths(&sections, &mut errors);

    for (i, p) in template.prerequisites.iter().enumerate() {
        check_regex(
            p.expected_output.as_deref(),
            &format!("prerequisites[{i}].expected_output"),
            &mut errors,
        );
    }
    for (stage, items) in [
        ("prereqs", &template.stages.prereqs),
        ("pre_update", &template.stages.pre_update),
        ("post_update", &template.stages.post_update),
        ("cleanup", &template.stages.cleanup),
    ] {
        for (i, s) in items.iter().enumerate() {
            check_regex(
                s.expected_output.as_deref(),
                &format!("stages.{stage}[{i}].expected_output"),
                &mut errors,
            );
        }
    }
    for (i, r) in template.inheritance_rules.iter().enumerate() {
        check_regex(
            r.condition.name_pattern.as_deref(),
            &format!("inheritance_rules[{i}].condition.name_pattern"),
            &mut errors,
        );
        check_regex(
            r.parameters.get("expected_output").and_then(|v| v.as_str()),
            &format!("inheritance_rules[{i}].parameters.expected_output"),
            &mut errors,
        );
    }

    errors
}

/// Merge identity of an item: name plus tag set.
type MergeIdentity<'a> = (&'a str, BTreeSet<&'a str>);

fn check_state_paths(sections: &[(String, &ItemLists)], errors: &mut Vec<String>) {
    // The same logical item may repeat across sections with the same path;
    // two different items may not share one.
    let mut owners: BTreeMap<(Category, &str), MergeIdentity<'_>> = BTreeMap::new();

    for (prefix, lists) in sections {
        let mut seen: HashSet<(Category, &str)> = HashSet::new();
        let commons = lists
            .files
            .iter()
            .map(|i| (Category::Files, &i.common))
            .chain(lists.registry.iter().map(|i| (Category::Registry, &i.common)))
            .chain(
                lists
                    .applications
                    .iter()
                    .map(|i| (Category::Applications, &i.common)),
            );
        for (category, common) in commons {
            let at = format!("{prefix}{category} item '{}'", common.name);
            let Some(path) = common.dynamic_state_path.as_deref().filter(|p| !p.is_empty())
            else {
                if common.action.captures() {
                    errors.push(format!("{at}: dynamic_state_path is required for capture"));
                }
                continue;
            };
            if let Some(problem) = state_path_problem(path) {
                errors.push(format!("{at}: dynamic_state_path '{path}' {problem}"));
                continue;
            }
            if !seen.insert((category, path)) {
                errors.push(format!("{at}: duplicate dynamic_state_path '{path}'"));
                continue;
            }
            let identity = (
                common.name.as_str(),
                common.inheritance_tags.iter().map(String::as_str).collect(),
            );
            match owners.get(&(category, path)) {
                Some(owner) if *owner != identity => errors.push(format!(
                    "{at}: dynamic_state_path '{path}' already used by '{}'",
                    owner.0
                )),
                Some(_) => {}
                None => {
                    owners.insert((category, path), identity);
                }
            }
        }
    }
}

/// Why a state path cannot be used inside a snapshot, if it cannot.
#[must_use]
pub fn state_path_problem(path: &str) -> Option<&'static str> {
    let bytes = path.as_bytes();
    let has_drive = bytes.get(1) == Some(&b':') && bytes.first().is_some_and(u8::is_ascii_alphabetic);
    if path.starts_with('/') || path.starts_with('\\') || has_drive {
        return Some("must be relative");
    }
    if path.split(['/', '\\']).any(|part| part == "..") {
        return Some("must not escape the snapshot");
    }
    None
}

fn check_regex(pattern: Option<&str>, at: &str, errors: &mut Vec<String>) {
    if let Some(p) = pattern
        && let Err(e) = Regex::new(p)
    {
        errors.push(format!("{at} is not a valid regex: {e}"));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn raw(yaml: &str) -> Value {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn reports_every_missing_field() {
        let doc = raw(
            "metadata: {}\nfiles:\n  - action: backup\nregistry:\n  - name: R\n    action: backup\n    type: value\n    key_path: 'HKCU:\\X'\napplications:\n  - name: A\n    action: backup\n",
        );
        let errors = required_fields(&doc);
        assert!(errors.contains(&"metadata.name is required".to_string()));
        assert!(errors.contains(&"files[0].name is required".to_string()));
        assert!(errors.contains(&"files[0].path is required".to_string()));
        assert!(errors.contains(&"registry[0].value_name is required for type value".to_string()));
        assert!(errors.contains(&"applications[0].discovery_command is required".to_string()));
        assert!(errors.contains(&"applications[0].install_procedure is required".to_string()));
    }

    #[test]
    fn checks_sections_prerequisites_and_stages() {
        let doc = raw(
            "metadata: {name: t}\nshared:\n  files:\n    - name: F\n      path: /x\nmachine_specific:\n  - files:\n      - name: G\n        action: sync\nprerequisites:\n  - type: application\n    name: git\nstages:\n  cleanup:\n    - name: tidy\n",
        );
        let errors = required_fields(&doc);
        assert!(errors.contains(&"shared.files[0].action is required".to_string()));
        assert!(errors.contains(&"machine_specific[0].files[0].path is required".to_string()));
        assert!(errors.contains(&"prerequisites[0].check_command is required".to_string()));
        assert!(errors.contains(&"stages.cleanup[0] requires script or path".to_string()));
    }

    #[test]
    fn complete_document_has_no_missing_fields() {
        let doc = raw(
            "metadata: {name: t}\nfiles:\n  - name: F\n    action: backup\n    source_path: ~/f\n",
        );
        assert!(required_fields(&doc).is_empty());
    }

    #[test]
    fn state_path_problems() {
        assert_eq!(state_path_problem("settings/app.json"), None);
        assert_eq!(state_path_problem("/etc/app"), Some("must be relative"));
        assert_eq!(state_path_problem("C:\\app"), Some("must be relative"));
        assert_eq!(
            state_path_problem("a/../../b"),
            Some("must not escape the snapshot")
        );
    }
}
