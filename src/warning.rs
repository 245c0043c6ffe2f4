//! Non-fatal findings collected during a run.
use std::fmt;

/// A non-fatal problem surfaced to the operator.
///
/// Warnings never stop processing; they are carried in the
/// [`ExecutionReport`](crate::engine::ExecutionReport) and logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Component that raised the warning (`resolver`, `prerequisite`,
    /// `stage:pre_update`, `files`, ...).
    pub source: String,
    /// The item, section or check concerned, if any.
    pub item: Option<String>,
    /// Human-readable warning message.
    pub message: String,
}

impl Warning {
    /// Create a warning attached to a named item.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            item: Some(item.into()),
            message: message.into(),
        }
    }

    /// Create a warning that concerns the run as a whole.
    #[must_use]
    pub fn general(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            item: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.item {
            Some(item) => write!(f, "[{}] {item}: {}", self.source, self.message),
            None => write!(f, "[{}] {}", self.source, self.message),
        }
    }
}
