//! Template execution: the state machine that drives one Backup, Sync,
//! Restore or Uninstall run.
//!
//! ```text
//! lock ─► preflight ─► Loaded ─► Resolved ─► PrereqsChecked ─► StagePrereqsRun
//!                                    │              │                │
//!                                    └──► Aborted ◄─┘                ▼
//!             Done ◄─ Cleaned ◄─ StagePostRun ◄─ ItemsProcessed ◄─ pre_update
//! ```
mod context;
mod report;
#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use context::EngineContext;
pub use report::{Counts, ExecutionReport, ItemReport, ItemStatus, RunState};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::extractors::{self, ExtractContext, ItemError};
use crate::logging::Logger;
use crate::platform::HostContext;
use crate::prerequisites;
use crate::snapshot::{self, ArtifactRecord, MANIFEST_VERSION, Manifest, Snapshot, SnapshotLock};
use crate::stages::{StageName, StageReport, run_stage};
use crate::template::{self, Category, EffectiveTemplate, Item};
use crate::warning::Warning;

/// The four operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Capture `backup` and `sync` items into a new snapshot.
    Backup,
    /// Capture `sync` items into a new snapshot.
    Sync,
    /// Apply every item from an existing snapshot.
    Restore,
    /// Remove application items recorded in an existing snapshot.
    Uninstall,
}

impl OperationKind {
    /// Whether the operation writes a new snapshot.
    #[must_use]
    pub const fn captures(self) -> bool {
        matches!(self, Self::Backup | Self::Sync)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Sync => "sync",
            Self::Restore => "restore",
            Self::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run `operation` for the template at `template_path` against
/// `snapshot_dir` with default services for `host`.
///
/// # Errors
///
/// Returns [`EngineError`] for pre-flight snapshot problems, malformed
/// templates and fatal resolution errors.
pub fn execute(
    template_path: &Path,
    operation: OperationKind,
    snapshot_dir: &Path,
    host: HostContext,
) -> Result<ExecutionReport, EngineError> {
    let log = Arc::new(Logger::new(operation.as_str()));
    let ctx = EngineContext::new(host, EngineConfig::default(), log);
    Engine::new(ctx).execute(template_path, operation, snapshot_dir)
}

/// Runs operations with injected services.
#[derive(Debug)]
pub struct Engine {
    ctx: EngineContext,
}

impl Engine {
    /// Create an engine over `ctx`.
    #[must_use]
    pub const fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Services used by this engine.
    #[must_use]
    pub const fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Run `operation`. The vault's cached key is cleared however the run
    /// ends.
    ///
    /// Item failures, prerequisite aborts and cancellation are reported in
    /// the returned [`ExecutionReport`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for pre-flight snapshot problems, malformed
    /// templates, fatal resolution errors and manifest write failures.
    pub fn execute(
        &self,
        template_path: &Path,
        operation: OperationKind,
        snapshot_dir: &Path,
    ) -> Result<ExecutionReport, EngineError> {
        let span = tracing::info_span!(
            "run",
            operation = %operation,
            snapshot = %snapshot::snapshot_id(snapshot_dir)
        );
        let result =
            span.in_scope(|| Run::start(&self.ctx, template_path, operation, snapshot_dir));
        self.ctx.vault.clear();
        result
    }
}

/// State of one run in progress.
struct Run<'a> {
    ctx: &'a EngineContext,
    operation: OperationKind,
    snapshot: Snapshot,
    report: ExecutionReport,
}

impl<'a> Run<'a> {
    fn start(
        ctx: &'a EngineContext,
        template_path: &Path,
        operation: OperationKind,
        snapshot_dir: &Path,
    ) -> Result<ExecutionReport, EngineError> {
        let root = snapshot::locate(snapshot_dir, operation)?;
        let _lock = SnapshotLock::acquire(&root)?;
        snapshot::preflight(&root, operation)?;
        let snapshot = Snapshot::new(&root);
        let previous = if operation.captures() {
            None
        } else {
            Some(snapshot.read_manifest()?)
        };

        let mut run = Run {
            ctx,
            operation,
            report: ExecutionReport::new(operation, &ctx.host.machine_name, root),
            snapshot,
        };
        run.execute(template_path, previous)?;
        Ok(run.report)
    }

    fn enter(&mut self, state: RunState) {
        self.ctx.log.debug(&format!("state: {state:?}"));
        self.report.states.push(state);
    }

    fn warn_all(&mut self, warnings: Vec<Warning>) {
        for w in &warnings {
            self.ctx.log.warn(&w.to_string());
        }
        self.report.warnings.extend(warnings);
    }

    fn abort(&mut self, reason: String) {
        self.ctx.log.error(&format!("aborting {}: {reason}", self.operation));
        self.report.abort_reason = Some(reason);
        self.enter(RunState::Aborted);
    }

    fn execute(
        &mut self,
        template_path: &Path,
        previous: Option<Manifest>,
    ) -> Result<(), EngineError> {
        let template = template::load(template_path)?;
        self.report.template_name.clone_from(&template.metadata.name);
        self.ctx.log.stage(&format!(
            "{} '{}' on {}",
            self.operation, template.metadata.name, self.ctx.host.machine_name
        ));
        self.enter(RunState::Loaded);

        let resolution = template::resolve(&template, self.ctx)?;
        if !resolution.matched_sections.is_empty() {
            self.ctx.log.debug(&format!(
                "matched sections: {}",
                resolution.matched_sections.join(", ")
            ));
        }
        self.warn_all(resolution.warnings);
        let effective = resolution.effective;
        self.enter(RunState::Resolved);

        let prereqs = prerequisites::evaluate(&effective.prerequisites, self.ctx, self.operation);
        let fatal: Vec<String> = prereqs.fatal.iter().map(ToString::to_string).collect();
        self.warn_all(prereqs.warnings.clone());
        self.report.prerequisites = prereqs;
        if !fatal.is_empty() {
            self.abort(fatal.join("; "));
            return Ok(());
        }
        self.enter(RunState::PrereqsChecked);

        let base_dir = template_path.parent().unwrap_or_else(|| Path::new("."));
        let stage = run_stage(
            &effective.stages.prereqs,
            StageName::Prereqs,
            self.ctx,
            base_dir,
        );
        let failed = stage_failures(&stage);
        self.report.stages.push(stage);
        if let Some(failed) = failed {
            if self.ctx.config.abort_on_stage_prereq_failure {
                self.abort(format!("prereqs stage failed: {failed}"));
                return Ok(());
            }
            self.warn_all(vec![Warning::general(
                StageName::Prereqs.as_str(),
                format!("stage failed: {failed}"),
            )]);
        }
        self.enter(RunState::StagePrereqsRun);

        if self.operation.captures() {
            self.snapshot.create()?;
        }
        self.run_warning_stage(&effective.stages.pre_update, StageName::PreUpdate, base_dir);

        let records = self.process_items(&effective, previous.as_ref());
        self.enter(RunState::ItemsProcessed);

        if self.operation.captures() {
            self.write_manifest(&effective, records)?;
        }

        if self.ctx.cancel.is_cancelled() {
            self.ctx.log.info("cancelled: skipping post_update");
        } else {
            self.run_warning_stage(&effective.stages.post_update, StageName::PostUpdate, base_dir);
            self.enter(RunState::StagePostRun);
        }

        let cleanup = run_stage(
            &effective.stages.cleanup,
            StageName::Cleanup,
            self.ctx,
            base_dir,
        );
        if let Some(failed) = stage_failures(&cleanup) {
            self.ctx.log.debug(&format!("cleanup failures: {failed}"));
        }
        self.report.stages.push(cleanup);
        self.enter(RunState::Cleaned);

        self.report.cancelled = self.ctx.cancel.is_cancelled();
        self.enter(RunState::Done);
        Ok(())
    }

    /// `pre_update`/`post_update`: failures become warnings.
    fn run_warning_stage(
        &mut self,
        items: &[template::StageItemSpec],
        stage: StageName,
        base_dir: &Path,
    ) {
        let report = run_stage(items, stage, self.ctx, base_dir);
        if let Some(failed) = stage_failures(&report) {
            self.warn_all(vec![Warning::general(
                stage.as_str(),
                format!("stage failed: {failed}"),
            )]);
        }
        self.report.stages.push(report);
    }

    /// Process every item in category order, returning the artifact records
    /// of successful captures.
    fn process_items(
        &mut self,
        effective: &EffectiveTemplate,
        previous: Option<&Manifest>,
    ) -> Vec<ArtifactRecord> {
        let ectx = ExtractContext {
            engine: self.ctx,
            snapshot: &self.snapshot,
            missing_prereqs: &self.report.prerequisites.missing,
        };
        let mut records = Vec::new();
        let mut reports = Vec::new();
        let mut warnings = Vec::new();

        for category in Category::ALL {
            for entry in effective.items_in(category) {
                let item = &entry.item;
                let _span = tracing::info_span!("item", item = %item.label()).entered();
                let status = if self.ctx.cancel.is_cancelled() {
                    ItemStatus::Skipped("cancelled".to_string())
                } else {
                    self.ctx.log.debug(&format!("{} {}", self.operation, item.label()));
                    match process_item(self.operation, item, previous, &ectx) {
                        Ok(Processed::Captured(record)) => {
                            records.push(record);
                            ItemStatus::Succeeded
                        }
                        Ok(Processed::Applied(w)) => {
                            warnings.extend(w);
                            ItemStatus::Succeeded
                        }
                        Ok(Processed::Skipped(reason)) => ItemStatus::Skipped(reason),
                        Err(ItemError::Cancelled) => ItemStatus::Skipped("cancelled".to_string()),
                        Err(e) => ItemStatus::Failed(e.to_string()),
                    }
                };
                self.ctx
                    .log
                    .record_item(&item.label(), status.outcome(), status.reason());
                reports.push(ItemReport {
                    category,
                    name: item.name().to_string(),
                    status,
                });
            }
        }

        self.report.items = reports;
        self.warn_all(warnings);
        records
    }

    fn write_manifest(
        &mut self,
        effective: &EffectiveTemplate,
        artifacts: Vec<ArtifactRecord>,
    ) -> Result<(), EngineError> {
        let manifest = Manifest {
            format_version: MANIFEST_VERSION,
            template_name: effective.metadata.name.clone(),
            template_version: effective.metadata.version.clone(),
            operation: self.operation,
            machine_name: self.ctx.host.machine_name.clone(),
            created_at: Utc::now(),
            cancelled: self.ctx.cancel.is_cancelled(),
            artifacts,
        };
        if let Err(e) = self.snapshot.write_manifest(&manifest) {
            self.ctx.log.error(&format!("cannot write manifest: {e}"));
            let _ = std::fs::remove_dir_all(self.snapshot.root());
            return Err(EngineError::Snapshot(e));
        }
        Ok(())
    }
}

enum Processed {
    Captured(ArtifactRecord),
    Applied(Vec<Warning>),
    Skipped(String),
}

fn process_item(
    operation: OperationKind,
    item: &Item,
    previous: Option<&Manifest>,
    ctx: &ExtractContext<'_>,
) -> Result<Processed, ItemError> {
    let action = item.common().action;
    if operation.captures() && !action.captured_by(operation) {
        return Ok(Processed::Skipped(format!(
            "action '{}' is not captured by {operation}",
            action.as_str()
        )));
    }
    if operation == OperationKind::Uninstall && item.category() != Category::Applications {
        return Ok(Processed::Skipped(
            "uninstall only removes applications".to_string(),
        ));
    }

    let record = previous.and_then(|m| {
        m.find(
            item.category(),
            item.name(),
            item.common().dynamic_state_path.as_deref(),
        )
    });
    if let Some(reason) = extractors::skip_reason(item, operation, record, ctx) {
        return Ok(Processed::Skipped(reason));
    }

    match operation {
        OperationKind::Backup | OperationKind::Sync => {
            extractors::capture(item, ctx).map(Processed::Captured)
        }
        OperationKind::Restore => extractors::apply(item, record, ctx).map(Processed::Applied),
        OperationKind::Uninstall => extractors::remove(item, record, ctx).map(Processed::Applied),
    }
}

/// Comma-separated names of failed stage items, if any failed.
fn stage_failures(report: &StageReport) -> Option<String> {
    let names: Vec<String> = report
        .failures()
        .map(|r| format!("{} ({})", r.name, r.message))
        .collect();
    (!names.is_empty()).then(|| names.join(", "))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::test_support::{ScriptedRunner, passphrase_vault, test_context};
    use std::path::PathBuf;

    struct Fixture {
        dir: tempfile::TempDir,
        home: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let home = dir.path().join("home");
            std::fs::create_dir_all(&home).unwrap();
            Self { dir, home }
        }

        fn template(&self, yaml: &str) -> PathBuf {
            let path = self.dir.path().join("template.yaml");
            std::fs::write(&path, yaml).unwrap();
            path
        }

        fn snapshot(&self) -> PathBuf {
            self.dir.path().join("snapshots").join("one")
        }

        fn context(&self) -> EngineContext {
            let mut ctx = test_context();
            ctx.host = ctx.host.with_env("HOME", self.home.display().to_string());
            ctx
        }
    }

    const SETTINGS: &str = "
metadata: {name: Desktop}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
";

    #[test]
    fn backup_then_restore_visits_every_state() {
        let fx = Fixture::new();
        std::fs::write(fx.home.join("settings.conf"), "theme=dark\n").unwrap();
        let template = fx.template(SETTINGS);
        let engine = Engine::new(fx.context());

        let backup = engine
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();
        assert!(backup.is_success(), "{}", backup.summary());
        assert_eq!(
            backup.states,
            vec![
                RunState::Loaded,
                RunState::Resolved,
                RunState::PrereqsChecked,
                RunState::StagePrereqsRun,
                RunState::ItemsProcessed,
                RunState::StagePostRun,
                RunState::Cleaned,
                RunState::Done,
            ]
        );
        let manifest = Snapshot::new(fx.snapshot()).read_manifest().unwrap();
        assert_eq!(manifest.artifacts.len(), 1);
        assert!(!SnapshotLock::path_for(&fx.snapshot()).exists());

        std::fs::write(fx.home.join("settings.conf"), "theme=light\n").unwrap();
        let restore = engine
            .execute(&template, OperationKind::Restore, &fx.snapshot())
            .unwrap();
        assert!(restore.is_success(), "{}", restore.summary());
        assert_eq!(
            std::fs::read_to_string(fx.home.join("settings.conf")).unwrap(),
            "theme=dark\n"
        );
    }

    #[test]
    fn fatal_prerequisite_aborts_before_snapshot_is_created() {
        let fx = Fixture::new();
        let template = fx.template(
            "
metadata: {name: Desktop}
prerequisites:
  - {type: application, name: tool, check_command: definitely-not-installed-tool --version, on_missing: fail_backup}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
",
        );
        let report = Engine::new(fx.context())
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();
        assert!(report.aborted());
        assert_eq!(report.final_state(), Some(RunState::Aborted));
        assert!(report.items.is_empty());
        assert!(!fx.snapshot().exists());
    }

    #[test]
    fn restore_items_are_skipped_by_backup() {
        let fx = Fixture::new();
        std::fs::write(fx.home.join("settings.conf"), "x").unwrap();
        let template = fx.template(
            "
metadata: {name: Desktop}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
  - {name: Seed, action: restore, path: ~/seed.conf}
",
        );
        let report = Engine::new(fx.context())
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();
        assert_eq!(
            report.status_of(Category::Files, "Settings"),
            Some(&ItemStatus::Succeeded)
        );
        assert!(matches!(
            report.status_of(Category::Files, "Seed"),
            Some(ItemStatus::Skipped(_))
        ));
    }

    #[test]
    fn cancelled_run_skips_items_but_still_cleans_up() {
        let fx = Fixture::new();
        std::fs::write(fx.home.join("settings.conf"), "x").unwrap();
        let template = fx.template(
            "
metadata: {name: Desktop}
stages:
  post_update: [{name: announce, script: post}]
  cleanup: [{name: tidy, script: tidy}]
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
",
        );
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = fx.context().with_scripts(runner.clone());
        ctx.cancel.cancel();
        let report = Engine::new(ctx)
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.final_state(), Some(RunState::Done));
        assert!(!report.states.contains(&RunState::StagePostRun));
        assert_eq!(
            report.status_of(Category::Files, "Settings"),
            Some(&ItemStatus::Skipped("cancelled".to_string()))
        );
        let scripts: Vec<String> = runner.calls().into_iter().map(|c| c.script).collect();
        assert_eq!(scripts, ["tidy"]);
        assert!(Snapshot::new(fx.snapshot()).read_manifest().unwrap().cancelled);
    }

    #[test]
    fn failing_prereqs_stage_aborts_unless_configured_otherwise() {
        let fx = Fixture::new();
        let template = fx.template(
            "
metadata: {name: Desktop}
stages:
  prereqs: [{name: gate, script: gate}]
",
        );
        let runner = Arc::new(ScriptedRunner::new().fail("gate", "not ready"));
        let report = Engine::new(fx.context().with_scripts(runner.clone()))
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();
        assert!(report.abort_reason.unwrap().contains("gate (not ready)"));

        let mut ctx = fx.context().with_scripts(runner);
        ctx.config.abort_on_stage_prereq_failure = false;
        let report = Engine::new(ctx)
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();
        assert!(!report.aborted());
        assert!(report.warnings.iter().any(|w| w.source == "prereqs"));
    }

    #[test]
    fn vault_key_is_cleared_after_the_run() {
        let fx = Fixture::new();
        std::fs::write(fx.home.join("token"), "secret").unwrap();
        let template = fx.template(
            "
metadata: {name: Desktop}
files:
  - {name: Token, action: backup, path: ~/token, dynamic_state_path: token, encrypt: true}
",
        );
        let engine = Engine::new(fx.context().with_vault(passphrase_vault("pw")));
        let report = engine
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();
        assert!(report.is_success(), "{}", report.summary());
        assert!(!engine.context().vault.is_key_cached());
    }

    #[test]
    fn uninstall_only_touches_applications() {
        let fx = Fixture::new();
        std::fs::write(fx.home.join("settings.conf"), "x").unwrap();
        let template = fx.template(
            "
metadata: {name: Desktop}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
applications:
  - {name: Tools, action: backup, discovery_command: list, parse_procedure: 'builtin:lines', install_procedure: add, uninstall_procedure: del, dynamic_state_path: tools.json}
",
        );
        let runner = Arc::new(ScriptedRunner::new().ok("list", "git\n"));
        let engine = Engine::new(fx.context().with_scripts(runner.clone()));
        engine
            .execute(&template, OperationKind::Backup, &fx.snapshot())
            .unwrap();

        let report = engine
            .execute(&template, OperationKind::Uninstall, &fx.snapshot())
            .unwrap();
        assert!(matches!(
            report.status_of(Category::Files, "Settings"),
            Some(ItemStatus::Skipped(_))
        ));
        assert_eq!(
            report.status_of(Category::Applications, "Tools"),
            Some(&ItemStatus::Succeeded)
        );
        assert!(runner.calls().iter().any(|c| c.script == "del"));
    }
}
