//! Prerequisite evaluation.
//!
//! Every declared prerequisite is checked; the `on_missing` policy of each
//! unsatisfied one decides whether it only warns or blocks the operation.
use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::engine::OperationKind;
use crate::error::PrerequisiteFailure;
use crate::template::{HostProbe, OnMissing, PrerequisiteKind, PrerequisiteSpec};
use crate::warning::Warning;

const SOURCE: &str = "prerequisite";

/// Outcome of one prerequisite check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrerequisiteResult {
    /// Prerequisite name.
    pub name: String,
    /// Check type.
    pub kind: PrerequisiteKind,
    /// Whether the check passed.
    pub satisfied: bool,
    /// Detail from the check.
    pub message: String,
}

/// Results of evaluating all prerequisites for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrerequisiteReport {
    /// Per-prerequisite results, in declared order.
    pub results: Vec<PrerequisiteResult>,
    /// Unsatisfied prerequisites that do not block this operation.
    pub warnings: Vec<Warning>,
    /// Unsatisfied prerequisites that block this operation.
    pub fatal: Vec<PrerequisiteFailure>,
    /// Names of every unsatisfied prerequisite.
    pub missing: BTreeSet<String>,
}

impl PrerequisiteReport {
    /// Whether any failure blocks the operation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !self.fatal.is_empty()
    }
}

/// Whether a missing prerequisite with `policy` blocks `operation`.
#[must_use]
pub const fn blocks(policy: OnMissing, operation: OperationKind) -> bool {
    match policy {
        OnMissing::Warn => false,
        OnMissing::FailBackup => matches!(operation, OperationKind::Backup),
        OnMissing::FailRestore => matches!(operation, OperationKind::Restore),
    }
}

/// Check every prerequisite and apply its `on_missing` policy.
#[must_use]
pub fn evaluate(
    prereqs: &[PrerequisiteSpec],
    probe: &dyn HostProbe,
    operation: OperationKind,
) -> PrerequisiteReport {
    let mut report = PrerequisiteReport::default();
    for spec in prereqs {
        let (satisfied, message) = match check(spec, probe) {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        if !satisfied {
            report.missing.insert(spec.name.clone());
            if blocks(spec.on_missing, operation) {
                report.fatal.push(PrerequisiteFailure {
                    name: spec.name.clone(),
                    message: message.clone(),
                });
            } else {
                report
                    .warnings
                    .push(Warning::new(SOURCE, spec.name.clone(), message.clone()));
            }
        }
        report.results.push(PrerequisiteResult {
            name: spec.name.clone(),
            kind: spec.kind,
            satisfied,
            message,
        });
    }
    report
}

/// Run one check. `Ok` carries a success detail, `Err` the reason it failed.
fn check(spec: &PrerequisiteSpec, probe: &dyn HostProbe) -> Result<String, String> {
    match spec.kind {
        PrerequisiteKind::Application => {
            let command = spec.check_command.as_deref().unwrap_or_default();
            let program = command.split_whitespace().next().unwrap_or_default();
            if program.is_empty() {
                return Err("no check_command".to_string());
            }
            if !probe.which(program) {
                return Err(format!("'{program}' not found on PATH"));
            }
            script_check(command, spec.expected_output.as_deref(), probe, true)
        }
        PrerequisiteKind::Registry => {
            let key = spec.key_path.as_deref().unwrap_or_default();
            let Some(actual) = probe.registry_value(key, spec.value_name.as_deref()) else {
                return Err(match &spec.value_name {
                    Some(name) => format!("{key}\\{name} is not set"),
                    None => format!("{key} does not exist"),
                });
            };
            match &spec.expected_value {
                Some(expected) if !value_matches(&actual, expected) => {
                    Err(format!("expected '{expected}', found '{actual}'"))
                }
                _ => Ok(format!("{key} present")),
            }
        }
        PrerequisiteKind::Script => {
            let script = spec.script.as_deref().unwrap_or_default();
            script_check(script, spec.expected_output.as_deref(), probe, false)
        }
    }
}

fn script_check(
    script: &str,
    expected: Option<&str>,
    probe: &dyn HostProbe,
    include_stderr: bool,
) -> Result<String, String> {
    let result = probe
        .run_script(script, &BTreeMap::new())
        .map_err(|e| e.to_string())?;
    let output = if include_stderr {
        result.combined_output()
    } else {
        result.stdout.clone()
    };
    let Some(pattern) = expected else {
        return if result.success {
            Ok("exit status 0".to_string())
        } else {
            Err(format!(
                "exited with status {}",
                result.code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ))
        };
    };
    let re = Regex::new(pattern).map_err(|e| format!("invalid expected_output: {e}"))?;
    if re.is_match(&output) {
        Ok(output.lines().next().unwrap_or_default().trim().to_string())
    } else {
        Err(format!(
            "output does not match '{pattern}': {}",
            output.trim()
        ))
    }
}

/// Compare a registry value with an expected value, numerically when both
/// sides are integers (decimal or `0x` hex).
fn value_matches(current: &str, expected: &str) -> bool {
    let current = current.trim();
    let expected = expected.trim();
    if let Some(hex) = expected
        .strip_prefix("0x")
        .or_else(|| expected.strip_prefix("0X"))
        && let Ok(n) = u64::from_str_radix(hex, 16)
    {
        return current.parse::<u64>().ok() == Some(n);
    }
    if let Ok(n) = expected.parse::<i64>() {
        return current.parse::<i64>().ok() == Some(n);
    }
    current.eq_ignore_ascii_case(expected)
}
