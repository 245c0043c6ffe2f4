//! Host identity: operating system, machine name, hostname and environment.
use std::collections::BTreeMap;
use std::fmt;

/// Detected operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    /// Linux and other Unix-like systems.
    Linux,
    /// Microsoft Windows.
    Windows,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

impl Os {
    /// Detect the operating system this binary was built for.
    #[must_use]
    pub const fn detect() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            // Default to Linux for other Unix-like systems
            Self::Linux
        }
    }
}

/// Identity of the machine an operation runs on.
///
/// Passed explicitly into every entry point; nothing in the engine reads
/// process-global state after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Short machine name (e.g. `WORKSTATION-01`).
    pub machine_name: String,
    /// Fully qualified hostname when known, otherwise the machine name.
    pub hostname: String,
    /// Environment variables visible to the engine.
    pub env: BTreeMap<String, String>,
    /// Operating system.
    pub os: Os,
}

impl HostContext {
    /// Detect the current host from the process environment.
    #[must_use]
    pub fn detect() -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let hostname = detect_hostname(&env);
        let machine_name = env
            .get("COMPUTERNAME")
            .cloned()
            .unwrap_or_else(|| short_name(&hostname).to_string());
        Self {
            machine_name,
            hostname,
            env,
            os: Os::detect(),
        }
    }

    /// Create a host with explicit identity and an empty environment.
    #[must_use]
    pub fn new(machine_name: impl Into<String>, hostname: impl Into<String>, os: Os) -> Self {
        Self {
            machine_name: machine_name.into(),
            hostname: hostname.into(),
            env: BTreeMap::new(),
            os,
        }
    }

    /// Add an environment variable (builder style).
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Look up an environment variable.
    ///
    /// On Windows variable names are case-insensitive, so a case-insensitive
    /// fallback is attempted there.
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<&str> {
        if let Some(v) = self.env.get(name) {
            return Some(v);
        }
        if self.os == Os::Windows {
            return self
                .env
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str());
        }
        None
    }

    /// The user's home directory, if the environment names one.
    #[must_use]
    pub fn home(&self) -> Option<&str> {
        match self.os {
            Os::Windows => self.env_var("USERPROFILE").or_else(|| self.env_var("HOME")),
            Os::Linux => self.env_var("HOME"),
        }
    }

    /// Whether this host has a native registry.
    #[must_use]
    pub fn has_registry(&self) -> bool {
        self.os == Os::Windows
    }
}

fn detect_hostname(env: &BTreeMap<String, String>) -> String {
    if let Some(h) = env.get("HOSTNAME").filter(|h| !h.is_empty()) {
        return h.clone();
    }
    if let Ok(h) = std::fs::read_to_string("/etc/hostname") {
        let h = h.trim();
        if !h.is_empty() {
            return h.to_string();
        }
    }
    env.get("COMPUTERNAME")
        .cloned()
        .unwrap_or_else(|| "localhost".to_string())
}

fn short_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}
