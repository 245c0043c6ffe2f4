//! Core logging types: item entries, outcomes, and the [`Log`] trait.

/// Item result recorded for the end-of-run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEntry {
    /// Item label, `<category>/<name>`.
    pub name: String,
    /// Final outcome of the item.
    pub outcome: ItemOutcome,
    /// Optional detail (skip reason or failure description).
    pub message: Option<String>,
}

/// Outcome of a processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Captured, applied or removed successfully.
    Succeeded,
    /// Not processed for this operation, or gated off.
    Skipped,
    /// Processing failed; other items were unaffected.
    Failed,
}

/// Abstraction over logging backends.
///
/// [`Logger`](super::logger::Logger) writes through `tracing`;
/// [`BufferedLog`](super::buffered::BufferedLog) defers output from
/// parallel workers; [`MemoryLog`](super::memory::MemoryLog) keeps
/// everything in memory for callers that inspect output afterwards.
pub trait Log: Send + Sync {
    /// Log a stage header (major section).
    fn stage(&self, msg: &str);
    /// Log an informational message.
    fn info(&self, msg: &str);
    /// Log a debug message (may be suppressed on console).
    fn debug(&self, msg: &str);
    /// Log a warning message.
    fn warn(&self, msg: &str);
    /// Log an error message.
    fn error(&self, msg: &str);
    /// Record an item result for the summary.
    fn record_item(&self, name: &str, outcome: ItemOutcome, message: Option<&str>);
}
