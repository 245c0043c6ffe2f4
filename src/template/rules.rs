//! Inheritance rules applied to merged items in declared order.
use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use super::inheritance::EffectiveItem;
use super::items::{Item, is_empty_value, value_to_string};
use super::model::{InheritanceRule, RuleAction, RuleCondition, TagMatch};
use super::selector::{self, HostProbe};
use crate::error::ResolveError;
use crate::exec::ExecResult;
use crate::warning::Warning;

const SOURCE: &str = "rule";

/// Result of applying one rule to one item.
enum Outcome {
    Keep(Item),
    Remove,
    ValidationFailed(String),
}

/// Apply `rules` to `items`.
///
/// Rule errors and validation failures leave the item unchanged and become
/// warnings, unless `strict`, in which case the first one aborts.
pub(crate) fn apply_rules(
    items: &mut Vec<EffectiveItem>,
    rules: &[InheritanceRule],
    probe: &dyn HostProbe,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<(), ResolveError> {
    for rule in rules {
        let mut kept = Vec::with_capacity(items.len());
        for mut entry in items.drain(..) {
            if !rule.applies_to_category(entry.item.category())
                || !condition_matches(&rule.condition, &entry.item, probe)
            {
                kept.push(entry);
                continue;
            }
            let label = entry.item.label();
            let failure = match apply_rule(rule, &entry.item, probe) {
                Ok(Outcome::Keep(item)) => {
                    entry.item = item;
                    None
                }
                Ok(Outcome::Remove) => continue,
                Ok(Outcome::ValidationFailed(reason)) => {
                    Some(format!("validation failed: {reason}"))
                }
                Err(reason) => Some(reason),
            };
            if let Some(reason) = failure {
                if strict {
                    return Err(ResolveError::RuleExecution {
                        rule: rule.name.clone(),
                        item: label,
                        reason,
                    });
                }
                warnings.push(Warning::new(
                    SOURCE,
                    label,
                    format!("{}: {reason}", rule.name),
                ));
            }
            kept.push(entry);
        }
        *items = kept;
    }
    Ok(())
}

/// Whether every present clause of `condition` holds for `item`.
fn condition_matches(condition: &RuleCondition, item: &Item, probe: &dyn HostProbe) -> bool {
    let tags = &item.common().inheritance_tags;
    if !condition.inheritance_tags.is_empty() {
        let has = |t: &String| tags.contains(t);
        let ok = match condition.tag_match {
            TagMatch::Any => condition.inheritance_tags.iter().any(has),
            TagMatch::All => condition.inheritance_tags.iter().all(has),
        };
        if !ok {
            return false;
        }
    }
    if let Some(pattern) = &condition.name_pattern
        && !Regex::new(pattern).is_ok_and(|re| re.is_match(item.name()))
    {
        return false;
    }
    condition.machine_selectors.is_empty() || selector::matches(&condition.machine_selectors, probe)
}

fn apply_rule(
    rule: &InheritanceRule,
    item: &Item,
    probe: &dyn HostProbe,
) -> Result<Outcome, String> {
    let mut candidate = item.clone();
    match rule.action {
        RuleAction::Skip => Ok(Outcome::Remove),
        RuleAction::Replace => {
            candidate
                .set_fields(&rule.parameters)
                .map_err(|e| e.to_string())?;
            Ok(Outcome::Keep(candidate))
        }
        RuleAction::Merge => {
            let mut fill = BTreeMap::new();
            for (name, value) in &rule.parameters {
                let current = candidate.field(name).map_err(|e| e.to_string())?;
                if is_empty_value(&current) {
                    fill.insert(name.clone(), value.clone());
                }
            }
            candidate.set_fields(&fill).map_err(|e| e.to_string())?;
            Ok(Outcome::Keep(candidate))
        }
        RuleAction::Transform => {
            let script = rule
                .script
                .as_deref()
                .ok_or_else(|| "transform requires a script".to_string())?;
            let output = run_rule_script(rule, script, item, probe)?;
            if !output.success {
                return Err(format!(
                    "script exited with status {}",
                    output.code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ));
            }
            let text = output.stdout.trim();
            if text.is_empty() {
                return Ok(Outcome::Keep(candidate));
            }
            let updates: BTreeMap<String, Value> = serde_yaml_ng::from_str(text)
                .map_err(|e| format!("unparsable transform output: {e}"))?;
            candidate.set_fields(&updates).map_err(|e| e.to_string())?;
            Ok(Outcome::Keep(candidate))
        }
        RuleAction::Validate => validate(rule, item, probe).map(|failure| {
            failure.map_or(Outcome::Keep(candidate), Outcome::ValidationFailed)
        }),
    }
}

/// Run a validate rule. `Ok(Some(reason))` means the item failed validation.
fn validate(
    rule: &InheritanceRule,
    item: &Item,
    probe: &dyn HostProbe,
) -> Result<Option<String>, String> {
    if let Some(script) = rule.script.as_deref() {
        let output = run_rule_script(rule, script, item, probe)?;
        if !output.success {
            return Ok(Some("validation script reported failure".to_string()));
        }
        if let Some(pattern) = rule.parameters.get("expected_output").and_then(Value::as_str) {
            let re = Regex::new(pattern).map_err(|e| e.to_string())?;
            if !re.is_match(&output.stdout) {
                return Ok(Some(format!("output does not match '{pattern}'")));
            }
        }
        return Ok(None);
    }

    let required: Vec<String> = match rule.parameters.get("required_fields") {
        Some(Value::Array(fields)) => fields.iter().map(value_to_string).collect(),
        Some(Value::String(list)) => list.split(',').map(|s| s.trim().to_string()).collect(),
        _ => return Err("validate requires a script or parameters.required_fields".to_string()),
    };
    let mut empty = Vec::new();
    for field in required {
        if is_empty_value(&item.field(&field).map_err(|e| e.to_string())?) {
            empty.push(field);
        }
    }
    Ok((!empty.is_empty()).then(|| format!("empty required field(s): {}", empty.join(", "))))
}

fn run_rule_script(
    rule: &InheritanceRule,
    script: &str,
    item: &Item,
    probe: &dyn HostProbe,
) -> Result<ExecResult, String> {
    let mut params = item.field_strings();
    params.insert("category".to_string(), item.category().to_string());
    params.insert("rule".to_string(), rule.name.clone());
    params.insert("machine_name".to_string(), probe.machine_name().to_string());
    params.insert("hostname".to_string(), probe.hostname().to_string());
    for (k, v) in &rule.parameters {
        params
            .entry(format!("param_{k}"))
            .or_insert_with(|| value_to_string(v));
    }
    probe
        .run_script(script, &params)
        .map_err(|e| format!("script failed: {e}"))
}
