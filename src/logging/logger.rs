//! Console/file logger with end-of-run item summary.
use std::path::PathBuf;
use std::sync::Mutex;

use super::types::{ItemEntry, ItemOutcome, Log};
use super::utils::log_file_path;

/// Implement the display methods of [`Log`] by delegating to inherent methods
/// of the same name on the implementing type.
macro_rules! forward_log_methods {
    ($($method:ident),+ $(,)?) => {
        $(
            fn $method(&self, msg: &str) {
                self.$method(msg);
            }
        )+
    };
}

/// Tracing-backed logger that also collects item results for the summary.
///
/// Every message is written to `$XDG_CACHE_HOME/statekeep/logs/<run>.log`
/// (default `~/.cache/statekeep/logs/<run>.log`) by the
/// [`FileLayer`](super::subscriber::FileLayer) regardless of console
/// verbosity.
#[derive(Debug)]
pub struct Logger {
    items: Mutex<Vec<ItemEntry>>,
    log_file: Option<PathBuf>,
}

impl Logger {
    /// Create a new logger for `run`, as named by
    /// [`run_log_name`](super::utils::run_log_name).
    ///
    /// Only remembers the log file path for the summary; the file itself is
    /// opened by [`init_subscriber`](super::subscriber::init_subscriber).
    #[must_use]
    pub fn new(run: &str) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            log_file: log_file_path(run),
        }
    }

    /// Return the log file path, if available.
    #[cfg(test)]
    pub const fn log_path(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    /// Return a clone of all recorded item entries.
    #[must_use]
    pub fn item_entries(&self) -> Vec<ItemEntry> {
        self.items.lock().map_or_else(|_| vec![], |g| g.clone())
    }

    /// Log an error message.
    pub fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    /// Log a warning message.
    pub fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    /// Log a stage header (major section).
    pub fn stage(&self, msg: &str) {
        tracing::info!(target: "statekeep::stage", "{msg}");
    }

    /// Log an informational message.
    pub fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    /// Log a debug message (suppressed on console unless verbose; always
    /// written to the log file).
    pub fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }

    /// Record an item result for the summary.
    pub fn record_item(&self, name: &str, outcome: ItemOutcome, message: Option<&str>) {
        if let Ok(mut guard) = self.items.lock() {
            guard.push(ItemEntry {
                name: name.to_string(),
                outcome,
                message: message.map(String::from),
            });
        }
    }

    /// Count the number of failed items.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.items.lock().map_or(0, |guard| {
            guard
                .iter()
                .filter(|t| t.outcome == ItemOutcome::Failed)
                .count()
        })
    }

    /// Print the summary of all recorded items.
    pub fn print_summary(&self) {
        let items = self.item_entries();
        if items.is_empty() {
            return;
        }

        self.stage("Summary");

        let mut succeeded = 0u32;
        let mut skipped = 0u32;
        let mut failed = 0u32;

        for item in &items {
            let (icon, color) = match item.outcome {
                ItemOutcome::Succeeded => {
                    succeeded += 1;
                    ("✓", "\x1b[32m")
                }
                ItemOutcome::Skipped => {
                    skipped += 1;
                    ("○", "\x1b[33m")
                }
                ItemOutcome::Failed => {
                    failed += 1;
                    ("✗", "\x1b[31m")
                }
            };

            let suffix = item
                .message
                .as_ref()
                .map_or_else(String::new, |msg| format!(" ({msg})"));

            self.info(&format!("{color}{icon} {}{suffix}\x1b[0m", item.name));
        }

        let total = succeeded + skipped + failed;
        self.info(&format!(
            "{total} items: \x1b[32m{succeeded} succeeded\x1b[0m, \x1b[33m{skipped} skipped\x1b[0m, \x1b[31m{failed} failed\x1b[0m"
        ));

        if let Some(path) = &self.log_file {
            self.info(&format!("\x1b[2mlog: {}\x1b[0m", path.display()));
        }
    }
}

impl Log for Logger {
    forward_log_methods!(stage, info, debug, warn, error);

    fn record_item(&self, name: &str, outcome: ItemOutcome, message: Option<&str>) {
        self.record_item(name, outcome, message);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::logging::isolated_logger;
    use std::fs;

    #[test]
    fn logger_new_has_no_items() {
        let (log, _tmp, _guard) = isolated_logger();
        assert!(log.item_entries().is_empty());
    }

    #[test]
    fn record_item_with_message() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record_item("files/Settings", ItemOutcome::Skipped, Some("optional"));
        let items = log.item_entries();
        assert_eq!(items[0].name, "files/Settings");
        assert_eq!(items[0].message, Some("optional".to_string()));
    }

    #[test]
    fn failure_count_returns_correct_count() {
        let (log, _tmp, _guard) = isolated_logger();
        assert_eq!(log.failure_count(), 0);
        log.record_item("a", ItemOutcome::Succeeded, None);
        log.record_item("b", ItemOutcome::Failed, Some("error 1"));
        log.record_item("c", ItemOutcome::Failed, Some("error 2"));
        log.record_item("d", ItemOutcome::Skipped, None);
        assert_eq!(log.failure_count(), 2);
    }

    #[test]
    fn log_trait_delegates_to_logger() {
        let (log, _tmp, _guard) = isolated_logger();
        let log_ref: &dyn Log = &log;
        log_ref.record_item("via-trait", ItemOutcome::Succeeded, None);
        assert_eq!(log.item_entries().len(), 1);
    }

    #[test]
    fn log_file_is_created() {
        let (log, _tmp, _guard) = isolated_logger();
        let path = log.log_path().expect("log path should exist");
        assert!(path.exists());
    }

    #[test]
    fn debug_always_written_to_file() {
        let (log, _tmp, _guard) = isolated_logger();
        let marker = format!("debug-marker-{}", std::process::id());
        log.debug(&marker);
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains(&marker));
    }

    #[test]
    fn warn_written_to_file_with_tag() {
        let (log, _tmp, _guard) = isolated_logger();
        let marker = format!("warn-marker-{}", std::process::id());
        log.warn(&marker);
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("[warn]"));
        assert!(contents.contains(&marker));
    }

    #[test]
    fn stage_written_to_file_with_arrow() {
        let (log, _tmp, _guard) = isolated_logger();
        let marker = format!("stage-marker-{}", std::process::id());
        log.stage(&marker);
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("==>"));
        assert!(contents.contains(&marker));
    }

    #[test]
    fn summary_is_written_without_ansi_codes() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record_item("files/Settings", ItemOutcome::Succeeded, None);
        log.record_item("registry/Theme", ItemOutcome::Failed, Some("access denied"));
        log.print_summary();
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("2 items: 1 succeeded, 0 skipped, 1 failed"));
        assert!(contents.contains("registry/Theme (access denied)"));
        assert!(!contents.contains('\x1b'));
    }
}
