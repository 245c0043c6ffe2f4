use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::crypto::Vault;
use crate::exec::{
    CancelToken, ExecError, ExecResult, Executor, Script, ScriptRunner, ShellScriptRunner,
    SystemExecutor,
};
use crate::extractors::{FileRegistry, PowerShellRegistry, RegistryStore};
use crate::logging::Log;
use crate::platform::HostContext;
use crate::stages::StageName;
use crate::template::HostProbe;

/// Services shared by every part of a run.
///
/// Every field is injectable so tests can substitute in-memory or scripted
/// implementations; [`EngineContext::new`] wires the real ones.
pub struct EngineContext {
    /// Identity and environment of the host.
    pub host: HostContext,
    /// Engine settings.
    pub config: EngineConfig,
    /// Command executor used for `which` lookups and registry access.
    pub executor: Arc<dyn Executor>,
    /// Script runner for discovery, install, rule and stage scripts.
    pub scripts: Arc<dyn ScriptRunner>,
    /// Registry-equivalent store.
    pub registry: Arc<dyn RegistryStore>,
    /// Encryption layer; its cached key is cleared at the end of a run.
    pub vault: Arc<Vault>,
    /// Log sink.
    pub log: Arc<dyn Log>,
    /// Cancellation flag shared with the CLI's interrupt handler.
    pub cancel: CancelToken,
    /// Runner for the `cleanup` stage, which ignores cancellation.
    cleanup_scripts: Arc<dyn ScriptRunner>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("executor", &"<dyn Executor>")
            .field("scripts", &"<dyn ScriptRunner>")
            .field("registry", &"<dyn RegistryStore>")
            .field("vault", &self.vault)
            .field("log", &"<dyn Log>")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Create a context with the system executor, a shell script runner,
    /// the platform's registry store and a vault keyed from `config`.
    #[must_use]
    pub fn new(host: HostContext, config: EngineConfig, log: Arc<dyn Log>) -> Self {
        let cancel = CancelToken::new();
        let executor: Arc<dyn Executor> = Arc::new(SystemExecutor);
        let registry = default_registry(&host, &config, &executor, &cancel);
        let vault = Arc::new(Vault::new(
            config.key_reference(),
            config.kdf_iterations,
            &host,
        ));
        Self {
            scripts: Arc::new(ShellScriptRunner::new(Arc::clone(&executor), cancel.clone())),
            cleanup_scripts: Arc::new(ShellScriptRunner::new(
                Arc::clone(&executor),
                CancelToken::new(),
            )),
            host,
            config,
            executor,
            registry,
            vault,
            log,
            cancel,
        }
    }

    /// Replace the executor. Script runners built on the previous executor
    /// are rebuilt on the new one.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.scripts = Arc::new(ShellScriptRunner::new(
            Arc::clone(&executor),
            self.cancel.clone(),
        ));
        self.cleanup_scripts = Arc::new(ShellScriptRunner::new(
            Arc::clone(&executor),
            CancelToken::new(),
        ));
        self.executor = executor;
        self
    }

    /// Replace the script runner used by every stage, including cleanup.
    #[must_use]
    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRunner>) -> Self {
        self.cleanup_scripts = Arc::clone(&scripts);
        self.scripts = scripts;
        self
    }

    /// Replace the registry-equivalent store.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn RegistryStore>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the vault.
    #[must_use]
    pub fn with_vault(mut self, vault: Vault) -> Self {
        self.vault = Arc::new(vault);
        self
    }

    /// Replace the log sink.
    #[must_use]
    pub fn with_log(mut self, log: Arc<dyn Log>) -> Self {
        self.log = log;
        self
    }

    /// Script runner for `stage`. Cleanup uses a runner that is never
    /// cancelled.
    #[must_use]
    pub fn stage_runner(&self, stage: StageName) -> Arc<dyn ScriptRunner> {
        match stage {
            StageName::Cleanup => Arc::clone(&self.cleanup_scripts),
            _ => Arc::clone(&self.scripts),
        }
    }
}

fn default_registry(
    host: &HostContext,
    config: &EngineConfig,
    executor: &Arc<dyn Executor>,
    cancel: &CancelToken,
) -> Arc<dyn RegistryStore> {
    if host.has_registry() {
        return Arc::new(PowerShellRegistry::new(
            Arc::clone(executor),
            config.command_timeout(),
            cancel.clone(),
        ));
    }
    let path = config
        .registry_file
        .clone()
        .unwrap_or_else(|| data_dir(host).join("statekeep").join("registry.json"));
    Arc::new(FileRegistry::new(path))
}

fn data_dir(host: &HostContext) -> PathBuf {
    if let Some(dir) = host.env_var("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    host.home().map_or_else(
        || PathBuf::from("."),
        |home| PathBuf::from(home).join(".local").join("share"),
    )
}

impl HostProbe for EngineContext {
    fn machine_name(&self) -> &str {
        &self.host.machine_name
    }

    fn hostname(&self) -> &str {
        &self.host.hostname
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.host.env_var(name).map(ToString::to_string)
    }

    fn registry_value(&self, key_path: &str, value_name: Option<&str>) -> Option<String> {
        match value_name {
            Some(name) => self
                .registry
                .read_value(key_path, name)
                .ok()
                .flatten()
                .map(|data| data.display_string()),
            None => self
                .registry
                .read_key(key_path)
                .ok()
                .flatten()
                .map(|_| String::new()),
        }
    }

    fn which(&self, program: &str) -> bool {
        self.executor.which(program)
    }

    fn run_script(
        &self,
        script: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<ExecResult, ExecError> {
        self.scripts.run_script(
            Script::Inline(script),
            params,
            None,
            self.config.command_timeout(),
        )
    }
}
