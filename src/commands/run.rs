//! Command: run one of the four operations against a snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use chrono::NaiveDateTime;

use crate::cli::RunOpts;
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineContext, ExecutionReport, OperationKind};
use crate::logging::{Log, Logger};
use crate::platform::HostContext;
use crate::snapshot;

/// Run `operation` against `snapshot` with the options given on the command
/// line.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the engine
/// rejects the run, the run aborts, or any item fails.
pub fn run(
    operation: OperationKind,
    opts: &RunOpts,
    snapshot: &Path,
    log: &Arc<Logger>,
) -> Result<()> {
    let config = load_config(opts)?;

    log.stage(&format!("{operation} {}", opts.template.display()));
    log.info(&format!("snapshot: {}", snapshot.display()));
    log.debug(&format!(
        "timeout {}s, {} workers",
        config.command_timeout_secs, config.worker_threads
    ));

    let sink: Arc<dyn Log> = Arc::<Logger>::clone(log);
    let ctx = EngineContext::new(HostContext::detect(), config, sink);
    let cancel = ctx.cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
        log.debug(&format!("interrupt handler not installed: {e}"));
    }

    let report = Engine::new(ctx)
        .execute(&opts.template, operation, snapshot)
        .with_context(|| format!("{operation} of {}", opts.template.display()))?;

    log.print_summary();
    check_report(&report)
}

/// Load the engine configuration and apply command-line overrides.
fn load_config(opts: &RunOpts) -> Result<EngineConfig> {
    let mut config = match &opts.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(var) = &opts.key_env {
        config.encryption.key_env = Some(var.clone());
        config.encryption.key_file = None;
    }
    if let Some(path) = &opts.key_file {
        config.encryption.key_file = Some(path.clone());
        config.encryption.key_env = None;
    }
    if let Some(secs) = opts.timeout {
        config.command_timeout_secs = secs;
    }
    Ok(config)
}

/// Snapshot directory for this run, with `--snapshot-root` runs named after
/// `now`. `--snapshot-root` only makes sense for operations that create a
/// snapshot.
///
/// # Errors
///
/// Returns an error if `--snapshot-root` is given to Restore or Uninstall.
pub fn snapshot_dir(operation: OperationKind, opts: &RunOpts, now: NaiveDateTime) -> Result<PathBuf> {
    match (&opts.snapshot, &opts.snapshot_root) {
        (Some(dir), _) => Ok(dir.clone()),
        (None, Some(root)) if operation.captures() => Ok(snapshot::timestamped_path(root, now)),
        (None, Some(_)) => bail!("{operation} needs an existing --snapshot directory"),
        (None, None) => bail!("either --snapshot or --snapshot-root is required"),
    }
}

/// Turn an aborted, cancelled or partially failed run into an error.
fn check_report(report: &ExecutionReport) -> Result<()> {
    if let Some(reason) = &report.abort_reason {
        bail!("{} aborted: {reason}", report.operation);
    }
    if report.cancelled {
        bail!("{} cancelled", report.operation);
    }
    let failed = report.counts().failed;
    if failed > 0 {
        bail!("{failed} item(s) failed during {}", report.operation);
    }
    Ok(())
}
