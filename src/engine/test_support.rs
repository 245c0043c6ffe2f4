//! Test doubles for engine services.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::crypto::{KeyReference, Vault};
use crate::exec::{ExecError, ExecResult, Script, ScriptRunner};
use crate::extractors::RegistryStore;
use crate::extractors::registry_store::{KeyValues, RegistryData, RegistryError};
use crate::logging::MemoryLog;
use crate::platform::{HostContext, Os};

use super::EngineContext;

/// Context for `WS01` on Linux with scripted-nothing services: an empty
/// [`ScriptedRunner`], an in-memory registry, a disabled vault and a
/// [`MemoryLog`].
pub fn test_context() -> EngineContext {
    test_context_with_log(Arc::new(MemoryLog::new()))
}

/// [`test_context`] logging into `log`.
pub fn test_context_with_log(log: Arc<MemoryLog>) -> EngineContext {
    let host = HostContext::new("WS01", "ws01.corp.example.com", Os::Linux);
    EngineContext::new(host, EngineConfig::default(), log)
        .with_scripts(Arc::new(ScriptedRunner::new()))
        .with_registry(Arc::new(MemoryRegistry::default()))
        .with_vault(Vault::disabled())
}

/// A vault keyed by `passphrase` with a cheap iteration count.
pub fn passphrase_vault(passphrase: &str) -> Vault {
    let host = HostContext::new("WS01", "ws01", Os::Linux);
    Vault::new(
        Some(KeyReference::Passphrase(passphrase.to_string())),
        10,
        &host,
    )
}

/// One recorded script invocation.
#[derive(Debug, Clone)]
pub struct ScriptCall {
    /// Inline body, or the file path for script files.
    pub script: String,
    /// Parameters passed.
    pub params: BTreeMap<String, String>,
    /// Standard input passed.
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
enum Response {
    Output(ExecResult),
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    script: String,
    when: Option<(String, String)>,
    response: Response,
}

/// [`ScriptRunner`] answering from a table keyed by script body. Unknown
/// scripts succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    calls: Mutex<Vec<ScriptCall>>,
}

fn result(stdout: &str, stderr: &str, success: bool) -> ExecResult {
    ExecResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        success,
        code: Some(i32::from(!success)),
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(mut self, script: &str, when: Option<(&str, &str)>, response: Response) -> Self {
        self.rules.push(Rule {
            script: script.to_string(),
            when: when.map(|(k, v)| (k.to_string(), v.to_string())),
            response,
        });
        self
    }

    /// `script` exits 0 printing `stdout`.
    pub fn ok(self, script: &str, stdout: &str) -> Self {
        self.rule(script, None, Response::Output(result(stdout, "", true)))
    }

    /// `script` exits 1 printing `stderr`.
    pub fn fail(self, script: &str, stderr: &str) -> Self {
        self.rule(script, None, Response::Output(result("", stderr, false)))
    }

    /// `script` exits 1 printing `stderr` when parameter `key` equals `value`.
    pub fn fail_for(self, script: &str, key: &str, value: &str, stderr: &str) -> Self {
        self.rule(
            script,
            Some((key, value)),
            Response::Output(result("", stderr, false)),
        )
    }

    /// `script` times out.
    pub fn timeout(self, script: &str) -> Self {
        self.rule(script, None, Response::Timeout)
    }

    /// Every invocation so far, in call order.
    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ScriptRunner for ScriptedRunner {
    fn run_script(
        &self,
        script: Script<'_>,
        params: &BTreeMap<String, String>,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError> {
        let body = match script {
            Script::Inline(body) => body.to_string(),
            Script::File(path) => path.display().to_string(),
        };
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScriptCall {
                script: body.clone(),
                params: params.clone(),
                stdin: stdin.map(ToString::to_string),
            });

        let rule = self
            .rules
            .iter()
            .filter(|r| r.script == body)
            .filter(|r| {
                r.when
                    .as_ref()
                    .is_none_or(|(k, v)| params.get(k) == Some(v))
            })
            .max_by_key(|r| r.when.is_some());
        match rule.map(|r| &r.response) {
            Some(Response::Output(out)) => Ok(out.clone()),
            Some(Response::Timeout) => Err(ExecError::Timeout {
                program: "sh".to_string(),
                timeout,
            }),
            None => Ok(result("", "", true)),
        }
    }
}

/// [`RegistryStore`] held in memory with case-insensitive key and value
/// names.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    keys: Mutex<BTreeMap<String, KeyValues>>,
}

impl RegistryStore for MemoryRegistry {
    fn read_key(&self, key: &str) -> Result<Option<KeyValues>, RegistryError> {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys.get(&key.to_ascii_lowercase()).cloned())
    }

    fn write_value(&self, key: &str, name: &str, data: &RegistryData) -> Result<(), RegistryError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let values = keys.entry(key.to_ascii_lowercase()).or_default();
        values.retain(|n, _| !n.eq_ignore_ascii_case(name));
        values.insert(name.to_string(), data.clone());
        Ok(())
    }

    fn delete_value(&self, key: &str, name: &str) -> Result<(), RegistryError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(values) = keys.get_mut(&key.to_ascii_lowercase()) {
            values.retain(|n, _| !n.eq_ignore_ascii_case(name));
        }
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), RegistryError> {
        let lower = key.trim_end_matches('\\').to_ascii_lowercase();
        let prefix = format!("{lower}\\");
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.retain(|k, _| *k != lower && !k.starts_with(&prefix));
        Ok(())
    }
}
