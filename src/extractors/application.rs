//! Installed-application inventories.
//!
//! Capture runs the discovery command and normalizes its output into a
//! JSON list of [`PackageEntry`]. Apply installs every captured package
//! that is not already present; remove uninstalls them. Per-package
//! procedures run on a bounded rayon pool, each worker logging through its
//! own [`BufferedLog`].
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::helpers::{read_artifact, sha256_hex, write_artifact};
use super::{ExtractContext, Extractor, ItemError, state_path};
use crate::engine::OperationKind;
use crate::exec::{ExecError, Script};
use crate::logging::{BufferedLog, Log};
use crate::snapshot::ArtifactRecord;
use crate::template::{ApplicationItem, Category};
use crate::warning::Warning;

const BUILTIN_JSON: &str = "builtin:json";
const BUILTIN_LINES: &str = "builtin:lines";
const BUILTIN_TSV: &str = "builtin:tsv";

/// One installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    /// Display name.
    #[serde(alias = "Name")]
    pub name: String,
    /// Package manager identifier; defaults to the name.
    #[serde(default, alias = "Id", alias = "PackageIdentifier")]
    pub id: String,
    /// Installed version, when reported.
    #[serde(default, alias = "Version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PackageEntry {
    fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            self.id.clone_from(&self.name);
        }
        self.version = self
            .version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        self
    }

    fn key(&self) -> String {
        self.id.to_lowercase()
    }
}

/// Extractor for [`ApplicationItem`]s.
#[derive(Debug, Clone, Copy)]
pub struct ApplicationExtractor;

fn label(item: &ApplicationItem) -> String {
    format!("applications/{}", item.common.name)
}

fn base_params(item: &ApplicationItem) -> BTreeMap<String, String> {
    BTreeMap::from([("package_manager".to_string(), item.package_manager.clone())])
}

/// Parse discovery output with one of the built-in parsers, or `None` when
/// `procedure` is not a built-in.
///
/// # Errors
///
/// Returns [`ItemError::Parse`] if the output does not fit the parser.
pub fn parse_builtin(procedure: &str, output: &str) -> Option<Result<Vec<PackageEntry>, ItemError>> {
    match procedure.trim() {
        BUILTIN_JSON => Some(parse_json(output)),
        BUILTIN_LINES => Some(Ok(parse_lines(output))),
        BUILTIN_TSV => Some(Ok(parse_tsv(output))),
        _ => None,
    }
}

/// A JSON array of package objects or plain names.
fn parse_json(output: &str) -> Result<Vec<PackageEntry>, ItemError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<Value> = serde_json::from_str(trimmed)
        .map_err(|e| ItemError::Parse(format!("inventory is not a JSON array: {e}")))?;
    values
        .into_iter()
        .map(|value| match value {
            Value::String(name) => Ok(PackageEntry {
                name,
                id: String::new(),
                version: None,
            }),
            other => serde_json::from_value::<PackageEntry>(other)
                .map_err(|e| ItemError::Parse(format!("bad inventory entry: {e}"))),
        })
        .map(|entry| entry.map(PackageEntry::normalized))
        .filter(|entry| !matches!(entry, Ok(e) if e.name.is_empty()))
        .collect()
}

fn content_lines(output: &str) -> impl Iterator<Item = &str> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
}

/// One package name per line.
fn parse_lines(output: &str) -> Vec<PackageEntry> {
    content_lines(output)
        .map(|line| {
            PackageEntry {
                name: line.to_string(),
                id: String::new(),
                version: None,
            }
            .normalized()
        })
        .collect()
}

/// `name<TAB>id<TAB>version`, trailing columns optional.
fn parse_tsv(output: &str) -> Vec<PackageEntry> {
    content_lines(output)
        .map(|line| {
            let mut cols = line.split('\t');
            PackageEntry {
                name: cols.next().unwrap_or_default().to_string(),
                id: cols.next().unwrap_or_default().to_string(),
                version: cols.next().map(ToString::to_string),
            }
            .normalized()
        })
        .filter(|e| !e.name.is_empty())
        .collect()
}

/// Run discovery and parse its output into a sorted, de-duplicated list.
fn discover(
    item: &ApplicationItem,
    ctx: &ExtractContext<'_>,
) -> Result<Vec<PackageEntry>, ItemError> {
    let timeout = ctx.engine.config.command_timeout();
    let params = base_params(item);
    let result = ctx.engine.scripts.run_script(
        Script::Inline(&item.discovery_command),
        &params,
        None,
        timeout,
    )?;
    if !result.success {
        return Err(ItemError::Command(format!(
            "discovery command failed: {}",
            result.combined_output().trim()
        )));
    }

    let mut entries = match parse_builtin(&item.parse_procedure, &result.stdout) {
        Some(parsed) => parsed?,
        None => {
            let parsed = ctx.engine.scripts.run_script(
                Script::Inline(&item.parse_procedure),
                &params,
                Some(&result.stdout),
                timeout,
            )?;
            if !parsed.success {
                return Err(ItemError::Command(format!(
                    "parse procedure failed: {}",
                    parsed.combined_output().trim()
                )));
            }
            parse_json(&parsed.stdout)?
        }
    };
    entries.sort_by(|a, b| a.key().cmp(&b.key()));
    entries.dedup_by(|a, b| a.key() == b.key());
    Ok(entries)
}

/// Read the captured inventory from the snapshot.
fn read_inventory(
    item: &ApplicationItem,
    record: Option<&ArtifactRecord>,
    ctx: &ExtractContext<'_>,
) -> Result<(Vec<PackageEntry>, Vec<Warning>), ItemError> {
    let record = record.ok_or_else(|| ItemError::ArtifactMissing(label(item)))?;
    let path = ctx.snapshot.artifact_path(Category::Applications, &record.path);
    let bytes = read_artifact(&path, record.encrypted, ctx.engine.vault.as_ref())?;
    let mut warnings = Vec::new();
    if let Some(expected) = &record.sha256
        && *expected != sha256_hex(&bytes)
    {
        warnings.push(Warning::new(
            Category::Applications.as_str(),
            label(item),
            format!("checksum mismatch for {}", path.display()),
        ));
    }
    let entries =
        serde_json::from_slice(&bytes).map_err(|e| ItemError::Parse(e.to_string()))?;
    Ok((entries, warnings))
}

/// Current inventory keys, or `None` when discovery is unavailable.
fn installed_keys(item: &ApplicationItem, ctx: &ExtractContext<'_>) -> Option<BTreeSet<String>> {
    match discover(item, ctx) {
        Ok(entries) => Some(entries.iter().map(PackageEntry::key).collect()),
        Err(ItemError::Cancelled) => None,
        Err(e) => {
            ctx.engine.log.debug(&format!(
                "{}: rediscovery failed, treating inventory as empty: {e}",
                label(item)
            ));
            None
        }
    }
}

/// Run `procedure` once per entry on a pool of `worker_threads`.
///
/// # Errors
///
/// Returns [`ItemError::Cancelled`] if the run was cancelled, or
/// [`ItemError::Command`] listing every entry that failed.
fn run_per_entry(
    item: &ApplicationItem,
    procedure: &str,
    verb: &str,
    entries: &[PackageEntry],
    ctx: &ExtractContext<'_>,
) -> Result<(), ItemError> {
    if entries.is_empty() {
        return Ok(());
    }
    let engine = ctx.engine;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(engine.config.worker_threads.max(1))
        .build()
        .map_err(|e| ItemError::Command(format!("cannot start worker pool: {e}")))?;
    let timeout = engine.config.command_timeout();
    let failures: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());

    let span = tracing::Span::current();
    pool.install(|| {
        entries.par_iter().for_each(|entry| {
            if engine.cancel.is_cancelled() {
                return;
            }
            let _span = span.enter();
            let log = BufferedLog::new(Arc::clone(&engine.log));
            let mut params = base_params(item);
            params.insert("package_id".to_string(), entry.id.clone());
            params.insert("package_name".to_string(), entry.name.clone());
            params.insert(
                "package_version".to_string(),
                entry.version.clone().unwrap_or_default(),
            );

            log.debug(&format!("{verb} {} ({})", entry.name, entry.id));
            let failure = match engine
                .scripts
                .run_script(Script::Inline(procedure), &params, None, timeout)
            {
                Ok(result) if result.success => None,
                Ok(result) => Some(result.combined_output().trim().to_string()),
                Err(ExecError::Cancelled { .. }) => None,
                Err(e) => Some(ItemError::from(e).to_string()),
            };
            if let Some(reason) = failure {
                log.warn(&format!("{verb} {} failed: {reason}", entry.id));
                failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((entry.id.clone(), reason));
            }
            log.flush();
        });
    });

    if engine.cancel.is_cancelled() {
        return Err(ItemError::Cancelled);
    }
    let mut failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
    if failures.is_empty() {
        return Ok(());
    }
    failures.sort();
    let listed: Vec<String> = failures
        .iter()
        .map(|(id, reason)| {
            if reason.is_empty() {
                id.clone()
            } else {
                format!("{id} ({reason})")
            }
        })
        .collect();
    Err(ItemError::Command(format!(
        "{} of {} packages failed to {verb}: {}",
        failures.len(),
        entries.len(),
        listed.join("; ")
    )))
}

impl Extractor for ApplicationExtractor {
    type Item = ApplicationItem;

    fn category_name(&self) -> &'static str {
        Category::Applications.as_str()
    }

    fn skip_reason(
        &self,
        item: &ApplicationItem,
        operation: OperationKind,
        _record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Option<String> {
        if let Some(dep) = item
            .dependencies
            .iter()
            .find(|d| ctx.missing_prereqs.contains(d.as_str()))
        {
            return Some(format!("dependency '{dep}' is missing"));
        }
        (operation == OperationKind::Uninstall && item.uninstall_procedure.is_none())
            .then(|| "no uninstall_procedure declared".to_string())
    }

    fn capture(
        &self,
        item: &ApplicationItem,
        ctx: &ExtractContext<'_>,
    ) -> Result<ArtifactRecord, ItemError> {
        let rel = state_path(&item.common)?;
        let entries = discover(item, ctx)?;
        let bytes =
            serde_json::to_vec_pretty(&entries).map_err(|e| ItemError::Parse(e.to_string()))?;
        let path = ctx.snapshot.artifact_path(Category::Applications, rel);
        write_artifact(&path, &bytes, item.common.encrypt, ctx.engine.vault.as_ref())?;
        ctx.engine.log.debug(&format!(
            "{}: captured {} packages",
            label(item),
            entries.len()
        ));

        let mut record = ArtifactRecord::new(
            Category::Applications,
            &item.common.name,
            rel,
            item.common.encrypt,
        );
        record.sha256 = Some(sha256_hex(&bytes));
        Ok(record)
    }

    fn apply(
        &self,
        item: &ApplicationItem,
        record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Warning>, ItemError> {
        let (entries, warnings) = read_inventory(item, record, ctx)?;
        let installed = installed_keys(item, ctx).unwrap_or_default();
        let pending: Vec<PackageEntry> = entries
            .into_iter()
            .filter(|e| !installed.contains(&e.key()))
            .collect();
        if pending.is_empty() {
            ctx.engine
                .log
                .debug(&format!("{}: all packages already installed", label(item)));
        }
        run_per_entry(item, &item.install_procedure, "install", &pending, ctx)?;
        Ok(warnings)
    }

    fn remove(
        &self,
        item: &ApplicationItem,
        record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Warning>, ItemError> {
        let Some(procedure) = item.uninstall_procedure.as_deref() else {
            return Err(ItemError::UnsupportedOperation {
                operation: "remove",
                category: self.category_name(),
            });
        };
        let (entries, warnings) = read_inventory(item, record, ctx)?;
        let targets: Vec<PackageEntry> = match installed_keys(item, ctx) {
            Some(installed) => entries
                .into_iter()
                .filter(|e| installed.contains(&e.key()))
                .collect(),
            None => entries,
        };
        run_per_entry(item, procedure, "uninstall", &targets, ctx)?;
        Ok(warnings)
    }
}
