//! Buffered logger for parallel workers.
use std::sync::{Arc, Mutex};

use super::types::{ItemOutcome, Log};

/// A single buffered log entry, replayed when flushed.
#[derive(Debug, Clone)]
enum LogEntry {
    Stage(String),
    Info(String),
    Debug(String),
    Warn(String),
    Error(String),
}

impl LogEntry {
    fn replay(&self, log: &dyn Log) {
        match self {
            Self::Stage(msg) => log.stage(msg),
            Self::Info(msg) => log.info(msg),
            Self::Debug(msg) => log.debug(msg),
            Self::Warn(msg) => log.warn(msg),
            Self::Error(msg) => log.error(msg),
        }
    }
}

/// Implement the display methods of [`Log`] by buffering each message as
/// the corresponding [`LogEntry`] variant.
macro_rules! buffer_log_methods {
    ($($method:ident => $variant:ident),+ $(,)?) => {
        $(
            fn $method(&self, msg: &str) {
                if let Ok(mut guard) = self.entries.lock() {
                    guard.push(LogEntry::$variant(msg.to_string()));
                }
            }
        )+
    };
}

/// Captures output from one worker so that parallel install or uninstall
/// procedures do not interleave their messages. Entries are replayed in
/// order by [`flush`](Self::flush).
///
/// [`record_item`](Log::record_item) is forwarded directly because the
/// backing logger's summary collection is already thread-safe.
pub struct BufferedLog {
    inner: Arc<dyn Log>,
    entries: Mutex<Vec<LogEntry>>,
}

impl std::fmt::Debug for BufferedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedLog")
            .field("inner", &"<dyn Log>")
            .field("entries", &self.entries)
            .finish()
    }
}

impl BufferedLog {
    /// Create a buffered logger backed by `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Log>) -> Self {
        Self {
            inner,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Replay and drain all buffered entries to the backing logger.
    pub fn flush(&self) {
        let entries = match self.entries.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for entry in &entries {
            entry.replay(self.inner.as_ref());
        }
    }
}

impl Log for BufferedLog {
    buffer_log_methods! {
        stage => Stage,
        info  => Info,
        debug => Debug,
        warn  => Warn,
        error => Error,
    }

    fn record_item(&self, name: &str, outcome: ItemOutcome, message: Option<&str>) {
        self.inner.record_item(name, outcome, message);
    }
}
