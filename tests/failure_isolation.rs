#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::wildcard_imports,
    clippy::indexing_slicing
)]
//! Integration tests for failures that must stay contained: one broken
//! item, a slow command, and prerequisites gated by operation.

mod common;

use common::{Sandbox, SandboxBuilder};

use statekeep::engine::{ItemStatus, OperationKind, RunState};
use statekeep::snapshot::Snapshot;
use statekeep::template::Category;

const FIVE_FILES: &str = "
metadata: {name: Desktop}
files:
  - {name: One, action: backup, path: ~/one, dynamic_state_path: one}
  - {name: Two, action: backup, path: ~/two, dynamic_state_path: two}
  - {name: Three, action: backup, path: ~/three, dynamic_state_path: three}
  - {name: Four, action: backup, path: ~/four, dynamic_state_path: four}
  - {name: Five, action: backup, path: ~/five, dynamic_state_path: five}
";

/// The third of five items fails; the other four are captured and listed
/// in the manifest.
#[test]
fn failed_item_does_not_stop_the_others() {
    let sandbox = Sandbox::new();
    for name in ["one", "two", "four", "five"] {
        sandbox.write_home(name, name);
    }
    let template = sandbox.template(FIVE_FILES);

    let report = sandbox.run(&template, OperationKind::Backup, "one");
    assert!(!report.aborted());
    assert!(!report.is_success());
    assert_eq!(report.final_state(), Some(RunState::Done));
    assert!(matches!(
        report.status_of(Category::Files, "Three"),
        Some(ItemStatus::Failed(_))
    ));
    let counts = report.counts();
    assert_eq!((counts.succeeded, counts.failed), (4, 1));

    let snapshot = Snapshot::new(sandbox.snapshot("one"));
    for name in ["one", "two", "four", "five"] {
        let artifact = snapshot.artifact_path(Category::Files, name);
        assert_eq!(std::fs::read_to_string(artifact).unwrap(), name);
    }
    assert!(!snapshot.artifact_path(Category::Files, "three").exists());
    let names: Vec<String> = snapshot
        .read_manifest()
        .unwrap()
        .artifacts
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, ["One", "Two", "Four", "Five"]);
}

/// A command exceeding the timeout fails its item without aborting the run.
#[cfg(unix)]
#[test]
fn timed_out_discovery_fails_only_its_item() {
    let sandbox = SandboxBuilder::new().with_timeout_secs(1).build();
    sandbox.write_home("settings.conf", "x");
    let template = sandbox.template(
        "
metadata: {name: Desktop}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
applications:
  - {name: Tools, action: backup, discovery_command: sleep 5, parse_procedure: 'builtin:lines', install_procedure: 'true', dynamic_state_path: tools.json}
",
    );
    let report = sandbox.run(&template, OperationKind::Backup, "one");
    assert!(!report.aborted());
    let status = report.status_of(Category::Applications, "Tools").unwrap();
    assert!(
        status.reason().is_some_and(|r| r.contains("timed out") || r.contains("timeout")),
        "{status}"
    );
    assert_eq!(
        report.status_of(Category::Files, "Settings"),
        Some(&ItemStatus::Succeeded)
    );
}

/// Real discovery output flows through the built-in parser into the
/// captured inventory.
#[cfg(unix)]
#[test]
fn application_inventory_is_captured_from_shell_output() {
    let sandbox = Sandbox::new();
    let template = sandbox.template(
        "
metadata: {name: Desktop}
applications:
  - {name: Tools, action: backup, discovery_command: 'printf \"git\\njq\\n\"', parse_procedure: 'builtin:lines', install_procedure: 'true', dynamic_state_path: tools.json}
",
    );
    let report = sandbox.run(&template, OperationKind::Backup, "one");
    assert!(report.is_success(), "{}", report.summary());
    let artifact = Snapshot::new(sandbox.snapshot("one"))
        .artifact_path(Category::Applications, "tools.json");
    let text = std::fs::read_to_string(artifact).unwrap();
    assert!(text.contains("\"git\""));
    assert!(text.contains("\"jq\""));
}

/// `fail_backup` blocks Backup but only warns during Restore.
#[test]
fn fail_backup_prerequisite_gates_backup_only() {
    let sandbox = Sandbox::new();
    sandbox.write_home("settings.conf", "theme=dark\n");
    let plain = sandbox.template(
        "
metadata: {name: Desktop}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
",
    );
    assert!(sandbox.run(&plain, OperationKind::Backup, "base").is_success());

    let gated = sandbox.template(
        "
metadata: {name: Desktop}
prerequisites:
  - {type: application, name: tool, check_command: statekeep-missing-tool --version, on_missing: fail_backup}
files:
  - {name: Settings, action: backup, path: ~/settings.conf, dynamic_state_path: settings.conf}
",
    );
    let backup = sandbox.run(&gated, OperationKind::Backup, "gated");
    assert!(backup.aborted());
    assert!(backup.items.is_empty());
    assert!(!sandbox.snapshot("gated").exists());

    sandbox.write_home("settings.conf", "theme=light\n");
    let restore = sandbox.run(&gated, OperationKind::Restore, "base");
    assert!(!restore.aborted());
    assert!(restore.warnings.iter().any(|w| w.item.as_deref() == Some("tool")));
    assert_eq!(sandbox.read_home("settings.conf"), "theme=dark\n");
}

/// Sync is not a backup: a missing `fail_backup` prerequisite only warns
/// and the sync items are still captured.
#[test]
fn fail_backup_prerequisite_only_warns_during_sync() {
    let sandbox = Sandbox::new();
    sandbox.write_home("notes.txt", "remember the milk\n");
    let template = sandbox.template(
        "
metadata: {name: Desktop}
prerequisites:
  - {type: application, name: tool, check_command: statekeep-missing-tool --version, on_missing: fail_backup}
files:
  - {name: Notes, action: sync, path: ~/notes.txt, dynamic_state_path: notes.txt}
",
    );
    let report = sandbox.run(&template, OperationKind::Sync, "one");
    assert!(!report.aborted(), "{}", report.summary());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.item.as_deref() == Some("tool"))
    );
    assert_eq!(
        report.status_of(Category::Files, "Notes"),
        Some(&ItemStatus::Succeeded)
    );
    assert!(Snapshot::new(sandbox.snapshot("one")).read_manifest().is_ok());
}
