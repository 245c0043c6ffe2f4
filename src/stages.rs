//! Lifecycle hook runner.
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use regex::Regex;

use crate::engine::EngineContext;
use crate::exec::{Script, ScriptRunner};
use crate::template::items::value_to_string;
use crate::template::{StageItemKind, StageItemSpec};

/// The four lifecycle stages, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    /// Before anything is touched.
    Prereqs,
    /// Before items are processed.
    PreUpdate,
    /// After items are processed.
    PostUpdate,
    /// Always last, even after cancellation.
    Cleanup,
}

impl StageName {
    /// Name as written in templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prereqs => "prereqs",
            Self::PreUpdate => "pre_update",
            Self::PostUpdate => "post_update",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageItemResult {
    /// Item name.
    pub name: String,
    /// Whether the script succeeded (and the check matched).
    pub success: bool,
    /// Failure reason or first line of output.
    pub message: String,
}

/// Results of running one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Which stage ran.
    pub stage: StageName,
    /// Per-item results in declared order.
    pub results: Vec<StageItemResult>,
    /// Items were left unrun because the run was cancelled.
    pub cancelled: bool,
}

impl StageReport {
    /// Results that failed.
    pub fn failures(&self) -> impl Iterator<Item = &StageItemResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Whether every item that ran succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Run stage items sequentially in declared order.
///
/// A failing item is recorded and the remaining items still run. Relative
/// script paths resolve against `base_dir` (the template's directory).
/// Except for cleanup, a cancelled run stops before the next item.
#[must_use]
pub fn run_stage(
    items: &[StageItemSpec],
    stage: StageName,
    ctx: &EngineContext,
    base_dir: &Path,
) -> StageReport {
    let mut report = StageReport {
        stage,
        results: Vec::with_capacity(items.len()),
        cancelled: false,
    };
    if items.is_empty() {
        return report;
    }
    ctx.log.stage(&format!("Stage {stage}"));
    let runner = ctx.stage_runner(stage);

    for item in items {
        if stage != StageName::Cleanup && ctx.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let result = run_item(item, stage, ctx, runner.as_ref(), base_dir);
        if result.success {
            ctx.log.debug(&format!("{}: ok {}", item.name, result.message));
        } else {
            ctx.log
                .debug(&format!("{}: failed: {}", item.name, result.message));
        }
        report.results.push(result);
    }
    report
}

fn run_item(
    item: &StageItemSpec,
    stage: StageName,
    ctx: &EngineContext,
    runner: &dyn ScriptRunner,
    base_dir: &Path,
) -> StageItemResult {
    let failed = |message: String| StageItemResult {
        name: item.name.clone(),
        success: false,
        message,
    };

    let mut params: BTreeMap<String, String> = item
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();
    params.insert("stage".to_string(), stage.to_string());
    params.insert("machine_name".to_string(), ctx.host.machine_name.clone());

    let resolved;
    let script = match (&item.script, &item.path) {
        (Some(body), _) => Script::Inline(body),
        (None, Some(path)) => {
            resolved = if path.is_relative() {
                base_dir.join(path)
            } else {
                path.clone()
            };
            Script::File(&resolved)
        }
        (None, None) => return failed("no script or path".to_string()),
    };

    let output = match runner.run_script(script, &params, None, ctx.config.command_timeout()) {
        Ok(output) => output,
        Err(e) => return failed(e.to_string()),
    };
    if !output.success {
        let detail = output.stderr.trim();
        return failed(format!(
            "exited with status {}{}{detail}",
            output.code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            if detail.is_empty() { "" } else { ": " }
        ));
    }
    if item.kind == StageItemKind::Check
        && let Some(pattern) = &item.expected_output
    {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(&output.stdout) => {}
            Ok(_) => return failed(format!("output does not match '{pattern}'")),
            Err(e) => return failed(format!("invalid expected_output: {e}")),
        }
    }
    StageItemResult {
        name: item.name.clone(),
        success: true,
        message: output.stdout.lines().next().unwrap_or_default().trim().to_string(),
    }
}
