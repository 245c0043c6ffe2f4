//! Structured outcome of one run.
use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;

use super::OperationKind;
use crate::logging::ItemOutcome;
use crate::prerequisites::PrerequisiteReport;
use crate::stages::StageReport;
use crate::template::Category;
use crate::warning::Warning;

/// States a run passes through, in order. `Aborted` ends a run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Template parsed.
    Loaded,
    /// Inheritance resolved.
    Resolved,
    /// Prerequisites evaluated without a fatal failure.
    PrereqsChecked,
    /// `prereqs` stage ran without aborting.
    StagePrereqsRun,
    /// Every item was processed (or skipped).
    ItemsProcessed,
    /// `post_update` stage ran.
    StagePostRun,
    /// `cleanup` stage ran.
    Cleaned,
    /// Run finished.
    Done,
    /// Run stopped before touching items.
    Aborted,
}

/// Final status of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    /// The operation completed for this item.
    Succeeded,
    /// The operation failed; the run continued.
    Failed(String),
    /// The item was not processed.
    Skipped(String),
}

impl ItemStatus {
    /// Matching log outcome.
    #[must_use]
    pub const fn outcome(&self) -> ItemOutcome {
        match self {
            Self::Succeeded => ItemOutcome::Succeeded,
            Self::Failed(_) => ItemOutcome::Failed,
            Self::Skipped(_) => ItemOutcome::Skipped,
        }
    }

    /// Failure or skip reason.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Failed(r) | Self::Skipped(r) => Some(r),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(r) => write!(f, "failed: {r}"),
            Self::Skipped(r) => write!(f, "skipped: {r}"),
        }
    }
}

/// Status of one item in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    /// Item category.
    pub category: Category,
    /// Item name.
    pub name: String,
    /// Final status.
    pub status: ItemStatus,
}

impl ItemReport {
    /// `category/name`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }
}

/// Item tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items that were skipped.
    pub skipped: usize,
}

/// Everything that happened during one run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Operation performed.
    pub operation: OperationKind,
    /// Template name from its metadata (empty if loading failed).
    pub template_name: String,
    /// Machine the run targeted.
    pub machine_name: String,
    /// Snapshot directory used.
    pub snapshot: PathBuf,
    /// States visited, in order.
    pub states: Vec<RunState>,
    /// Per-item results in processing order.
    pub items: Vec<ItemReport>,
    /// Non-fatal problems from every phase.
    pub warnings: Vec<Warning>,
    /// Prerequisite evaluation.
    pub prerequisites: PrerequisiteReport,
    /// Stage reports in run order.
    pub stages: Vec<StageReport>,
    /// Why the run aborted, if it did.
    pub abort_reason: Option<String>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl ExecutionReport {
    /// An empty report for `operation` on `snapshot`.
    #[must_use]
    pub fn new(operation: OperationKind, machine_name: &str, snapshot: PathBuf) -> Self {
        Self {
            operation,
            template_name: String::new(),
            machine_name: machine_name.to_string(),
            snapshot,
            states: Vec::new(),
            items: Vec::new(),
            warnings: Vec::new(),
            prerequisites: PrerequisiteReport::default(),
            stages: Vec::new(),
            abort_reason: None,
            cancelled: false,
        }
    }

    /// Last state reached.
    #[must_use]
    pub fn final_state(&self) -> Option<RunState> {
        self.states.last().copied()
    }

    /// Whether the run was aborted.
    #[must_use]
    pub const fn aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// Item tallies.
    #[must_use]
    pub fn counts(&self) -> Counts {
        self.items
            .iter()
            .fold(Counts::default(), |mut acc, item| {
                match item.status {
                    ItemStatus::Succeeded => acc.succeeded += 1,
                    ItemStatus::Failed(_) => acc.failed += 1,
                    ItemStatus::Skipped(_) => acc.skipped += 1,
                }
                acc
            })
    }

    /// Whether the run completed without aborting and no item failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.aborted() && self.counts().failed == 0
    }

    /// Status of an item by category and name.
    #[must_use]
    pub fn status_of(&self, category: Category, name: &str) -> Option<&ItemStatus> {
        self.items
            .iter()
            .find(|i| i.category == category && i.name == name)
            .map(|i| &i.status)
    }

    /// Plain-text summary: one line per item, then totals, warnings and
    /// the abort reason.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} '{}' on {}",
            self.operation, self.template_name, self.machine_name
        );
        for item in &self.items {
            let _ = writeln!(out, "  {:<32} {}", item.label(), item.status);
        }
        let c = self.counts();
        let _ = writeln!(
            out,
            "{} items: {} succeeded, {} skipped, {} failed",
            self.items.len(),
            c.succeeded,
            c.skipped,
            c.failed
        );
        for warning in &self.warnings {
            let _ = writeln!(out, "warning: {warning}");
        }
        if let Some(reason) = &self.abort_reason {
            let _ = writeln!(out, "aborted: {reason}");
        }
        if self.cancelled {
            out.push_str("cancelled\n");
        }
        out
    }
}
