//! Engine configuration: timeouts, worker pool size, key source.
//!
//! Settings come from an optional TOML file; CLI flags override individual
//! fields afterwards. Every field has a default so an absent file is valid.
pub mod toml_loader;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::crypto::KeyReference;

/// Default timeout for every external command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Default size of the application install/uninstall worker pool.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default PBKDF2 iteration count for key derivation.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Where the encryption key comes from.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Environment variable holding the passphrase.
    pub key_env: Option<String>,
    /// File whose contents are the passphrase.
    pub key_file: Option<PathBuf>,
}

/// Settings consumed by the engine for a single run.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied to every external command, in seconds.
    pub command_timeout_secs: u64,
    /// Worker threads for application install/uninstall procedures.
    pub worker_threads: usize,
    /// PBKDF2 iterations used when deriving the encryption key.
    pub kdf_iterations: u32,
    /// Whether a failed `prereqs` stage item aborts the run.
    pub abort_on_stage_prereq_failure: bool,
    /// Encryption key source.
    pub encryption: EncryptionConfig,
    /// Backing file of the registry-equivalent store on hosts without a
    /// native registry. Defaults to `$XDG_DATA_HOME/statekeep/registry.json`.
    pub registry_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            worker_threads: DEFAULT_WORKER_THREADS,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            abort_on_stage_prereq_failure: true,
            encryption: EncryptionConfig::default(),
            registry_file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if a
    /// value is out of range.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = toml_loader::load_config(path)
            .with_context(|| format!("loading engine config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            anyhow::bail!("command_timeout_secs must be greater than zero");
        }
        if self.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than zero");
        }
        if self.kdf_iterations == 0 {
            anyhow::bail!("kdf_iterations must be greater than zero");
        }
        Ok(())
    }

    /// Timeout applied to every external command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The configured key source, if any. A key file takes precedence over
    /// an environment variable.
    #[must_use]
    pub fn key_reference(&self) -> Option<KeyReference> {
        self.encryption
            .key_file
            .clone()
            .map(KeyReference::File)
            .or_else(|| self.encryption.key_env.clone().map(KeyReference::Env))
    }
}
