//! Command: print version information.

use crate::logging::Log;

/// Version string, overridable at build time through `STATEKEEP_VERSION`.
#[must_use]
pub fn version() -> &'static str {
    option_env!("STATEKEEP_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Log the statekeep version.
pub fn run(log: &dyn Log) {
    log.info(&format!("statekeep {}", version()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLog;

    #[test]
    fn logs_package_version() {
        let log = MemoryLog::new();
        run(&log);
        let expected = format!("statekeep {}", version());
        assert!(log.messages().iter().any(|(_, m)| *m == expected));
    }
}
