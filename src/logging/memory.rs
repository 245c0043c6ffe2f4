//! In-memory logger for embedding the engine and for tests.
use std::sync::Mutex;

use super::types::{ItemEntry, ItemOutcome, Log};

/// Severity of a captured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Stage header.
    Stage,
    /// Informational.
    Info,
    /// Debug detail.
    Debug,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

/// A [`Log`] that keeps every message and item record in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    messages: Mutex<Vec<(Level, String)>>,
    items: Mutex<Vec<ItemEntry>>,
}

impl MemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: Level, msg: &str) {
        if let Ok(mut guard) = self.messages.lock() {
            guard.push((level, msg.to_string()));
        }
    }

    /// All captured messages in order.
    #[must_use]
    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().map_or_else(|_| vec![], |g| g.clone())
    }

    /// Captured messages at `level`.
    #[must_use]
    pub fn at(&self, level: Level) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    /// Recorded item entries in order.
    #[must_use]
    pub fn items(&self) -> Vec<ItemEntry> {
        self.items.lock().map_or_else(|_| vec![], |g| g.clone())
    }
}

impl Log for MemoryLog {
    fn stage(&self, msg: &str) {
        self.push(Level::Stage, msg);
    }

    fn info(&self, msg: &str) {
        self.push(Level::Info, msg);
    }

    fn debug(&self, msg: &str) {
        self.push(Level::Debug, msg);
    }

    fn warn(&self, msg: &str) {
        self.push(Level::Warn, msg);
    }

    fn error(&self, msg: &str) {
        self.push(Level::Error, msg);
    }

    fn record_item(&self, name: &str, outcome: ItemOutcome, message: Option<&str>) {
        if let Ok(mut guard) = self.items.lock() {
            guard.push(ItemEntry {
                name: name.to_string(),
                outcome,
                message: message.map(String::from),
            });
        }
    }
}
