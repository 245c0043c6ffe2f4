//! Machine selector evaluation.
//!
//! Selectors decide whether a machine-specific block, conditional section
//! or rule applies to the current host. Evaluation fails closed: any input
//! that cannot be read (unset variable, unreadable registry value, failing
//! script, invalid regex, non-numeric operand) makes the selector false.
use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde::Deserialize;

use super::items::scalar_string;
use super::model::ConditionLogic;
use crate::exec::{ExecError, ExecResult};

/// What a selector inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// The short machine name.
    MachineName,
    /// The full hostname (operator defaults to `matches`).
    HostnamePattern,
    /// An environment variable.
    EnvironmentVariable,
    /// A registry-equivalent value.
    RegistryValue,
    /// Output of a script.
    Script,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// String equality.
    Equals,
    /// Substring test.
    Contains,
    /// Regular-expression test.
    Matches,
    /// String inequality.
    NotEquals,
    /// Numeric `>`.
    GreaterThan,
    /// Numeric `<`.
    LessThan,
}

/// A single host test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MachineSelector {
    /// What to inspect.
    #[serde(rename = "type")]
    pub kind: SelectorKind,
    /// Expected value (or `NAME=expected` for nameless environment selectors).
    #[serde(default, deserialize_with = "scalar_string")]
    pub value: String,
    /// Comparison; defaults per kind.
    #[serde(default)]
    pub operator: Option<Operator>,
    /// Compare case-sensitively.
    #[serde(default)]
    pub case_sensitive: bool,
    /// Environment variable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Registry key path.
    #[serde(default)]
    pub key_path: Option<String>,
    /// Registry value name.
    #[serde(default)]
    pub value_name: Option<String>,
    /// Script body.
    #[serde(default)]
    pub script: Option<String>,
}

impl MachineSelector {
    /// Build a selector of `kind` comparing against `value` with defaults.
    #[must_use]
    pub fn new(kind: SelectorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            operator: None,
            case_sensitive: false,
            name: None,
            key_path: None,
            value_name: None,
            script: None,
        }
    }

    /// The operator in effect.
    #[must_use]
    pub fn effective_operator(&self) -> Operator {
        self.operator.unwrap_or(match self.kind {
            SelectorKind::HostnamePattern => Operator::Matches,
            _ => Operator::Equals,
        })
    }
}

/// Read access to the host, as needed by selectors, rules and
/// prerequisite checks.
pub trait HostProbe: Send + Sync {
    /// Short machine name.
    fn machine_name(&self) -> &str;

    /// Full hostname.
    fn hostname(&self) -> &str;

    /// Environment variable value, `None` when unset.
    fn env_var(&self, name: &str) -> Option<String>;

    /// Registry-equivalent value as a string, `None` when unreadable.
    /// Without `value_name` this reports whether the key exists (`Some("")`).
    fn registry_value(&self, key_path: &str, value_name: Option<&str>) -> Option<String>;

    /// Whether `program` resolves on `PATH`.
    fn which(&self, program: &str) -> bool;

    /// Run an inline script with `params` exported to its environment.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] if the script cannot be started, times out or
    /// is cancelled.
    fn run_script(
        &self,
        script: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<ExecResult, ExecError>;

    /// Trimmed standard output of a script that exited 0.
    fn script_output(&self, script: &str) -> Option<String> {
        self.run_script(script, &BTreeMap::new())
            .ok()
            .filter(|r| r.success)
            .map(|r| r.stdout.trim().to_string())
    }
}

/// Whether any selector matches. An empty list matches unconditionally.
pub fn matches(selectors: &[MachineSelector], probe: &dyn HostProbe) -> bool {
    selectors.is_empty() || selectors.iter().any(|s| selector_matches(s, probe))
}

/// Combine conditions of a conditional section.
///
/// With no conditions `and` and `not` hold while `or` does not.
pub fn conditions_hold(
    conditions: &[MachineSelector],
    logic: ConditionLogic,
    probe: &dyn HostProbe,
) -> bool {
    match logic {
        ConditionLogic::And => conditions.iter().all(|c| selector_matches(c, probe)),
        ConditionLogic::Or => conditions.iter().any(|c| selector_matches(c, probe)),
        ConditionLogic::Not => !conditions.iter().any(|c| selector_matches(c, probe)),
    }
}

/// Evaluate one selector against the host.
pub fn selector_matches(selector: &MachineSelector, probe: &dyn HostProbe) -> bool {
    let mut expected = selector.value.as_str();
    let actual = match selector.kind {
        SelectorKind::MachineName => Some(probe.machine_name().to_string()),
        SelectorKind::HostnamePattern => Some(probe.hostname().to_string()),
        SelectorKind::EnvironmentVariable => {
            let name = match &selector.name {
                Some(name) => name.as_str(),
                None => match selector.value.split_once('=') {
                    Some((name, value)) => {
                        expected = value;
                        name
                    }
                    None => return false,
                },
            };
            probe.env_var(name)
        }
        SelectorKind::RegistryValue => {
            let Some(key) = selector.key_path.as_deref() else {
                return false;
            };
            probe.registry_value(key, selector.value_name.as_deref())
        }
        SelectorKind::Script => {
            // Without a separate script body the value is the script and
            // success alone decides.
            let Some(script) = selector.script.as_deref() else {
                return probe.script_output(&selector.value).is_some();
            };
            let output = probe.script_output(script);
            if selector.value.is_empty() {
                return output.is_some();
            }
            output
        }
    };
    actual.is_some_and(|actual| {
        compare(
            &actual,
            expected,
            selector.effective_operator(),
            selector.case_sensitive,
        )
    })
}

/// Apply `op` to `actual` and `expected`.
#[must_use]
pub fn compare(actual: &str, expected: &str, op: Operator, case_sensitive: bool) -> bool {
    let fold = |s: &str| {
        if case_sensitive {
            s.to_string()
        } else {
            s.to_lowercase()
        }
    };
    match op {
        Operator::Equals => fold(actual) == fold(expected),
        Operator::NotEquals => fold(actual) != fold(expected),
        Operator::Contains => fold(actual).contains(&fold(expected)),
        Operator::Matches => RegexBuilder::new(expected)
            .case_insensitive(!case_sensitive)
            .build()
            .is_ok_and(|re| re.is_match(actual)),
        Operator::GreaterThan => numeric(actual, expected).is_some_and(|(a, e)| a > e),
        Operator::LessThan => numeric(actual, expected).is_some_and(|(a, e)| a < e),
    }
}

fn numeric(actual: &str, expected: &str) -> Option<(f64, f64)> {
    let a = actual.trim().parse::<f64>().ok()?;
    let e = expected.trim().parse::<f64>().ok()?;
    (a.is_finite() && e.is_finite()).then_some((a, e))
}

#[cfg(test)]
pub(crate) mod test_probe {
    //! In-memory [`HostProbe`] for resolver and evaluator tests.
    use super::*;
    use std::sync::Mutex;

    /// Scripted host: scripts are looked up by exact body.
    #[derive(Debug, Default)]
    pub struct FakeProbe {
        pub machine: String,
        pub host: String,
        pub env: BTreeMap<String, String>,
        pub registry: BTreeMap<(String, String), String>,
        pub programs: Vec<String>,
        pub scripts: BTreeMap<String, ExecResult>,
        pub script_calls: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    impl FakeProbe {
        pub fn new(machine: &str) -> Self {
            Self {
                machine: machine.to_string(),
                host: format!("{}.corp.example.com", machine.to_lowercase()),
                ..Self::default()
            }
        }

        pub fn with_env(mut self, k: &str, v: &str) -> Self {
            self.env.insert(k.to_string(), v.to_string());
            self
        }

        pub fn with_registry(mut self, key: &str, name: &str, data: &str) -> Self {
            self.registry
                .insert((key.to_string(), name.to_string()), data.to_string());
            self
        }

        pub fn with_program(mut self, program: &str) -> Self {
            self.programs.push(program.to_string());
            self
        }

        pub fn with_script(mut self, body: &str, stdout: &str, success: bool) -> Self {
            self.scripts.insert(
                body.to_string(),
                ExecResult {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    success,
                    code: Some(i32::from(!success)),
                },
            );
            self
        }
    }

    impl HostProbe for FakeProbe {
        fn machine_name(&self) -> &str {
            &self.machine
        }

        fn hostname(&self) -> &str {
            &self.host
        }

        fn env_var(&self, name: &str) -> Option<String> {
            self.env.get(name).cloned()
        }

        fn registry_value(&self, key_path: &str, value_name: Option<&str>) -> Option<String> {
            match value_name {
                Some(name) => self
                    .registry
                    .get(&(key_path.to_string(), name.to_string()))
                    .cloned(),
                None => self
                    .registry
                    .keys()
                    .any(|(k, _)| k == key_path)
                    .then(String::new),
            }
        }

        fn which(&self, program: &str) -> bool {
            self.programs.iter().any(|p| p == program)
        }

        fn run_script(
            &self,
            script: &str,
            params: &BTreeMap<String, String>,
        ) -> Result<ExecResult, ExecError> {
            if let Ok(mut calls) = self.script_calls.lock() {
                calls.push((script.to_string(), params.clone()));
            }
            self.scripts
                .get(script)
                .cloned()
                .ok_or_else(|| ExecError::Spawn {
                    program: "sh".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such script"),
                })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::test_probe::FakeProbe;
    use super::*;

    fn sel(yaml: &str) -> MachineSelector {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn empty_selector_list_matches() {
        assert!(matches(&[], &FakeProbe::new("WS01")));
    }

    #[test]
    fn machine_name_is_case_insensitive_by_default() {
        let probe = FakeProbe::new("WORKSTATION-01");
        assert!(selector_matches(
            &sel("type: machine_name\nvalue: workstation-01"),
            &probe
        ));
        assert!(!selector_matches(
            &sel("type: machine_name\nvalue: workstation-01\ncase_sensitive: true"),
            &probe
        ));
    }

    #[test]
    fn selectors_are_ored() {
        let probe = FakeProbe::new("WS02");
        let list = vec![
            MachineSelector::new(SelectorKind::MachineName, "WS01"),
            MachineSelector::new(SelectorKind::MachineName, "WS02"),
        ];
        assert!(matches(&list, &probe));
        assert!(!matches(&list[..1], &probe));
    }

    #[test]
    fn hostname_pattern_defaults_to_regex() {
        let probe = FakeProbe::new("LAPTOP-7");
        assert!(selector_matches(
            &sel("type: hostname_pattern\nvalue: '^laptop-\\d+\\.corp'"),
            &probe
        ));
    }

    #[test]
    fn invalid_regex_fails_closed() {
        let probe = FakeProbe::new("WS01");
        assert!(!selector_matches(
            &sel("type: hostname_pattern\nvalue: '(['"),
            &probe
        ));
    }

    #[test]
    fn environment_variable_forms() {
        let probe = FakeProbe::new("WS01").with_env("ROLE", "Developer");
        assert!(selector_matches(
            &sel("type: environment_variable\nname: ROLE\nvalue: developer"),
            &probe
        ));
        assert!(selector_matches(
            &sel("type: environment_variable\nvalue: ROLE=dev\noperator: contains"),
            &probe
        ));
        assert!(!selector_matches(
            &sel("type: environment_variable\nname: UNSET\nvalue: ''\noperator: not_equals"),
            &probe
        ));
    }

    #[test]
    fn numeric_operators_coerce_and_fail_closed() {
        let probe = FakeProbe::new("WS01")
            .with_env("CORES", "16")
            .with_env("NAME", "abc");
        assert!(selector_matches(
            &sel("type: environment_variable\nname: CORES\nvalue: 8\noperator: greater_than"),
            &probe
        ));
        assert!(!selector_matches(
            &sel("type: environment_variable\nname: CORES\nvalue: 8\noperator: less_than"),
            &probe
        ));
        assert!(!selector_matches(
            &sel("type: environment_variable\nname: NAME\nvalue: 8\noperator: greater_than"),
            &probe
        ));
    }

    #[test]
    fn registry_value_selector() {
        let probe = FakeProbe::new("WS01").with_registry("HKCU:\\Software\\Theme", "Mode", "dark");
        assert!(selector_matches(
            &sel("type: registry_value\nkey_path: 'HKCU:\\Software\\Theme'\nvalue_name: Mode\nvalue: Dark"),
            &probe
        ));
        assert!(!selector_matches(
            &sel("type: registry_value\nkey_path: 'HKCU:\\Software\\Other'\nvalue_name: Mode\nvalue: dark"),
            &probe
        ));
    }

    #[test]
    fn script_selector_uses_output_or_exit_status() {
        let probe = FakeProbe::new("WS01")
            .with_script("detect-gpu", "nvidia\n", true)
            .with_script("is-laptop", "", false);
        assert!(selector_matches(
            &sel("type: script\nscript: detect-gpu\nvalue: nvidia"),
            &probe
        ));
        assert!(selector_matches(&sel("type: script\nvalue: detect-gpu"), &probe));
        assert!(!selector_matches(&sel("type: script\nvalue: is-laptop"), &probe));
        assert!(!selector_matches(&sel("type: script\nvalue: missing"), &probe));
    }

    #[test]
    fn condition_logic() {
        let probe = FakeProbe::new("WS01").with_env("ROLE", "dev");
        let yes = MachineSelector::new(SelectorKind::MachineName, "ws01");
        let no = MachineSelector::new(SelectorKind::MachineName, "ws99");
        let both = [yes.clone(), no.clone()];
        assert!(!conditions_hold(&both, ConditionLogic::And, &probe));
        assert!(conditions_hold(&both, ConditionLogic::Or, &probe));
        assert!(!conditions_hold(&both, ConditionLogic::Not, &probe));
        assert!(conditions_hold(&[no], ConditionLogic::Not, &probe));
        assert!(conditions_hold(&[], ConditionLogic::And, &probe));
        assert!(!conditions_hold(&[], ConditionLogic::Or, &probe));
        assert!(conditions_hold(&[], ConditionLogic::Not, &probe));
    }
}
