// Shared helpers for integration tests.
//
// Provides a temporary sandbox holding a fake home directory, a template
// file, a snapshot location and a file-backed registry store, so each
// integration test can drive the engine end to end without touching the
// real machine.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use statekeep::config::EngineConfig;
use statekeep::engine::{Engine, EngineContext, ExecutionReport, OperationKind};
use statekeep::extractors::FileRegistry;
use statekeep::logging::MemoryLog;
use statekeep::platform::{HostContext, Os};

/// Environment variable carrying the test passphrase inside the host context.
pub const KEY_ENV: &str = "STATEKEEP_TEST_KEY";

/// An isolated machine backed by a [`tempfile::TempDir`].
pub struct Sandbox {
    /// Temporary directory holding everything below.
    pub root: tempfile::TempDir,
    /// Engine settings used by [`Sandbox::engine`].
    pub config: EngineConfig,
    /// Log shared by every engine built from this sandbox.
    pub log: Arc<MemoryLog>,
}

impl Sandbox {
    /// Create a sandbox with an empty home directory and fast key derivation.
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(root.path().join("home")).expect("create home dir");
        let config = EngineConfig {
            kdf_iterations: 10,
            registry_file: Some(root.path().join("registry.json")),
            ..EngineConfig::default()
        };
        Self {
            root,
            config,
            log: Arc::new(MemoryLog::new()),
        }
    }

    /// Fake home directory (`~`).
    pub fn home(&self) -> PathBuf {
        self.root.path().join("home")
    }

    /// Write `content` to `~/<rel>`, creating parent directories.
    pub fn write_home(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.home().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&path, content).expect("write home file");
        path
    }

    /// Read `~/<rel>`.
    pub fn read_home(&self, rel: &str) -> String {
        std::fs::read_to_string(self.home().join(rel)).expect("read home file")
    }

    /// Write the template document and return its path.
    pub fn template(&self, yaml: &str) -> PathBuf {
        let path = self.root.path().join("template.yaml");
        std::fs::write(&path, yaml).expect("write template");
        path
    }

    /// Snapshot directory `snapshots/<name>` (not created).
    pub fn snapshot(&self, name: &str) -> PathBuf {
        self.root.path().join("snapshots").join(name)
    }

    /// Registry store backing file.
    pub fn registry_path(&self) -> &Path {
        self.config
            .registry_file
            .as_deref()
            .expect("registry file configured")
    }

    /// Host `WS01` on Linux whose home is the sandbox home.
    pub fn host(&self) -> HostContext {
        HostContext::new("WS01", "ws01.corp.example.com", Os::Linux)
            .with_env("HOME", self.home().display().to_string())
            .with_env(KEY_ENV, "correct horse battery staple")
    }

    /// Engine wired with real services and a file-backed registry.
    pub fn engine(&self) -> Engine {
        let ctx = EngineContext::new(self.host(), self.config.clone(), self.log.clone())
            .with_registry(Arc::new(FileRegistry::new(self.registry_path())));
        Engine::new(ctx)
    }

    /// Run `operation` on snapshot `name` and return the report.
    pub fn run(&self, template: &Path, operation: OperationKind, name: &str) -> ExecutionReport {
        self.engine()
            .execute(template, operation, &self.snapshot(name))
            .expect("engine run")
    }
}

/// Fluent builder for [`Sandbox`].
pub struct SandboxBuilder {
    sandbox: Sandbox,
}

impl SandboxBuilder {
    /// Begin building a new sandbox.
    pub fn new() -> Self {
        Self {
            sandbox: Sandbox::new(),
        }
    }

    /// Encrypt artifacts with the passphrase in [`KEY_ENV`].
    pub fn with_encryption(mut self) -> Self {
        self.sandbox.config.encryption.key_env = Some(KEY_ENV.to_string());
        self
    }

    /// Set the external command timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.sandbox.config.command_timeout_secs = secs;
        self
    }

    /// Finish building and return the configured sandbox.
    pub fn build(self) -> Sandbox {
        self.sandbox
    }
}
