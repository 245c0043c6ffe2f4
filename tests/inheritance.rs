#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::wildcard_imports,
    clippy::indexing_slicing,
    clippy::panic
)]
//! Integration tests for template resolution against a real host context.

mod common;

use common::Sandbox;

use statekeep::engine::{EngineContext, ItemStatus, OperationKind};
use statekeep::template::{self, Category, Item, Origin, RegistryValueKind, Resolution};

fn resolve(sandbox: &Sandbox, yaml: &str) -> Resolution {
    let path = sandbox.template(yaml);
    let parsed = template::load(&path).unwrap();
    let ctx = EngineContext::new(sandbox.host(), sandbox.config.clone(), sandbox.log.clone());
    template::resolve(&parsed, &ctx).unwrap()
}

const THEME: &str = r"
metadata: {name: Desktop}
shared:
  registry:
    - {name: Theme, action: backup, path: 'HKCU:\Software\Example\Theme', inheritance_tags: [theme], inheritance_priority: 50, dynamic_state_path: theme.json}
machine_specific:
  - name: workstation
    machine_selectors: [{type: machine_name, value: WS01}]
    registry:
      - {name: Theme, action: sync, path: 'HKCU:\Software\Example\Theme', inheritance_tags: [theme], inheritance_priority: 90, conflict_resolution: machine_wins, dynamic_state_path: theme.json}
";

/// A matching machine block overrides the shared item: one Theme item at
/// priority 90 carrying the machine block's fields.
#[test]
fn machine_block_overrides_shared_theme() {
    let sandbox = Sandbox::new();
    let resolution = resolve(&sandbox, THEME);
    let themes: Vec<_> = resolution.effective.items_in(Category::Registry).collect();
    assert_eq!(themes.len(), 1);
    assert_eq!(themes[0].priority, 90);
    assert_eq!(themes[0].origin, Origin::Machine("workstation".to_string()));
    assert!(matches!(&themes[0].item, Item::Registry(r) if r.common.action.as_str() == "sync"));
    assert_eq!(resolution.matched_sections, ["workstation"]);
}

/// Disjoint items from every layer all survive the merge.
#[test]
fn disjoint_items_are_all_kept() {
    let sandbox = Sandbox::new();
    let resolution = resolve(
        &sandbox,
        r"
metadata: {name: Desktop}
files:
  - {name: Base, action: backup, path: ~/base, dynamic_state_path: base}
shared:
  files:
    - {name: Shared, action: backup, path: ~/shared, dynamic_state_path: shared}
machine_specific:
  - machine_selectors: [{type: hostname_pattern, value: '\.corp\.example\.com$'}]
    files:
      - {name: Corp, action: backup, path: ~/corp, dynamic_state_path: corp}
  - machine_selectors: [{type: machine_name, value: LAPTOP}]
    files:
      - {name: Laptop, action: backup, path: ~/laptop, dynamic_state_path: laptop}
",
    );
    let names: Vec<&str> = resolution
        .effective
        .items_in(Category::Files)
        .map(|e| e.item.name())
        .collect();
    assert_eq!(names, ["Base", "Shared", "Corp"]);
}

/// The resolved template drives the run: the machine block's `sync` action
/// is what the Sync operation sees.
#[test]
fn resolved_action_decides_participation() {
    let sandbox = Sandbox::new();
    let path = sandbox.template(THEME);
    let report = sandbox.run(&path, OperationKind::Sync, "one");
    assert_eq!(
        report.status_of(Category::Registry, "Theme"),
        Some(&ItemStatus::Succeeded),
        "{}",
        report.summary()
    );
    assert_eq!(report.template_name, "Desktop");
}

/// `merge_both` keeps the shared block's written value type when the machine
/// block leaves it out.
#[test]
fn merge_both_keeps_shared_value_kind() {
    let sandbox = Sandbox::new();
    let resolution = resolve(
        &sandbox,
        r"
metadata: {name: Desktop}
shared:
  registry:
    - {name: Level, action: restore, path: 'HKCU:\Software\Example', type: value, value_name: Level, value_kind: dword, value_data: 3}
machine_specific:
  - machine_selectors: [{type: machine_name, value: WS01}]
    registry:
      - {name: Level, action: restore, path: 'HKCU:\Software\Example', type: value, value_name: Level, conflict_resolution: merge_both}
",
    );
    let level = resolution
        .effective
        .find(Category::Registry, "Level")
        .expect("Level resolved");
    let Item::Registry(r) = &level.item else {
        panic!("not a registry item");
    };
    assert_eq!(r.value_kind, RegistryValueKind::Dword);
    assert_eq!(r.value_data, Some(serde_json::Value::from(3)));
}
