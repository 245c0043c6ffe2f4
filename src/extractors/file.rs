//! File and directory items.
//!
//! Unencrypted artifacts are byte-for-byte copies of the source.
use std::path::{Path, PathBuf};

use super::helpers::{
    expand_path, join_relative, list_files, read_artifact, sha256_hex, write_artifact, write_file,
};
use super::{ExtractContext, Extractor, ItemError, state_path};
use crate::engine::OperationKind;
use crate::snapshot::{ArtifactRecord, FileChecksum};
use crate::template::{Category, ChecksumType, FileItem, FileKind};
use crate::warning::Warning;

/// Extractor for [`FileItem`]s.
#[derive(Debug, Clone, Copy)]
pub struct FileExtractor;

impl FileExtractor {
    fn source(item: &FileItem, ctx: &ExtractContext<'_>) -> PathBuf {
        expand_path(&item.path, &ctx.engine.host)
    }

    fn target(item: &FileItem, ctx: &ExtractContext<'_>) -> PathBuf {
        expand_path(
            item.destination.as_deref().unwrap_or(&item.path),
            &ctx.engine.host,
        )
    }
}

impl Extractor for FileExtractor {
    type Item = FileItem;

    fn category_name(&self) -> &'static str {
        Category::Files.as_str()
    }

    fn skip_reason(
        &self,
        item: &FileItem,
        operation: OperationKind,
        record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Option<String> {
        if !item.optional {
            return None;
        }
        if operation.captures() {
            let source = Self::source(item, ctx);
            return (!source.exists())
                .then(|| format!("optional source {} not present", source.display()));
        }
        record
            .is_none()
            .then(|| "optional item has no artifact".to_string())
    }

    fn capture(
        &self,
        item: &FileItem,
        ctx: &ExtractContext<'_>,
    ) -> Result<ArtifactRecord, ItemError> {
        let rel = state_path(&item.common)?;
        let source = Self::source(item, ctx);
        if !source.exists() {
            return Err(ItemError::SourceMissing(source));
        }
        let dest = ctx.snapshot.artifact_path(Category::Files, rel);
        let vault = ctx.engine.vault.as_ref();
        let encrypt = item.common.encrypt;
        let mut record = ArtifactRecord::new(Category::Files, &item.common.name, rel, encrypt);

        match item.kind {
            FileKind::File => {
                let bytes = std::fs::read(&source).map_err(ItemError::io("read", &source))?;
                write_artifact(&dest, &bytes, encrypt, vault)?;
                if item.checksum_type == ChecksumType::Sha256 {
                    record.sha256 = Some(sha256_hex(&bytes));
                }
            }
            FileKind::Directory => {
                if !source.is_dir() {
                    return Err(ItemError::io("read directory", &source)(
                        std::io::Error::other("not a directory"),
                    ));
                }
                std::fs::create_dir_all(&dest).map_err(ItemError::io("create", &dest))?;
                for rel_file in list_files(&source)? {
                    let from = join_relative(&source, &rel_file);
                    let bytes = std::fs::read(&from).map_err(ItemError::io("read", &from))?;
                    write_artifact(&join_relative(&dest, &rel_file), &bytes, encrypt, vault)?;
                    record.files.push(FileChecksum {
                        sha256: if item.checksum_type == ChecksumType::Sha256 {
                            sha256_hex(&bytes)
                        } else {
                            String::new()
                        },
                        path: rel_file,
                    });
                }
            }
        }
        ctx.engine
            .log
            .debug(&format!("captured {} -> {}", source.display(), dest.display()));
        Ok(record)
    }

    fn apply(
        &self,
        item: &FileItem,
        record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Warning>, ItemError> {
        let Some(record) = record else {
            return Err(ItemError::ArtifactMissing(format!(
                "files/{}",
                item.common.name
            )));
        };
        let artifact = ctx.snapshot.artifact_path(Category::Files, &record.path);
        let target = Self::target(item, ctx);
        let mut warnings = Vec::new();

        match item.kind {
            FileKind::File => {
                restore_file(
                    item,
                    &artifact,
                    &target,
                    record.sha256.as_deref(),
                    record.encrypted,
                    ctx,
                    &mut warnings,
                )?;
            }
            FileKind::Directory => {
                let entries: Vec<(String, Option<String>)> = if record.files.is_empty() {
                    list_files(&artifact)?
                        .into_iter()
                        .map(|p| (p, None))
                        .collect()
                } else {
                    record
                        .files
                        .iter()
                        .map(|f| (f.path.clone(), Some(f.sha256.clone()).filter(|s| !s.is_empty())))
                        .collect()
                };
                for (rel, sha) in entries {
                    restore_file(
                        item,
                        &join_relative(&artifact, &rel),
                        &join_relative(&target, &rel),
                        sha.as_deref(),
                        record.encrypted,
                        ctx,
                        &mut warnings,
                    )?;
                }
            }
        }
        Ok(warnings)
    }
}

/// Restore one file, verifying its checksum and skipping the write when
/// the target already holds the same bytes.
fn restore_file(
    item: &FileItem,
    artifact: &Path,
    target: &Path,
    expected: Option<&str>,
    encrypted: bool,
    ctx: &ExtractContext<'_>,
    warnings: &mut Vec<Warning>,
) -> Result<(), ItemError> {
    let bytes = read_artifact(artifact, encrypted, ctx.engine.vault.as_ref())?;
    if item.checksum_type == ChecksumType::Sha256
        && let Some(expected) = expected
    {
        let actual = sha256_hex(&bytes);
        if actual != expected {
            if item.verify {
                return Err(ItemError::ChecksumMismatch {
                    path: artifact.to_path_buf(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            warnings.push(Warning::new(
                Category::Files.as_str(),
                format!("files/{}", item.common.name),
                format!("checksum mismatch for {}", artifact.display()),
            ));
        }
    }
    if std::fs::read(target).is_ok_and(|current| current == bytes) {
        ctx.engine
            .log
            .debug(&format!("{} already up to date", target.display()));
        return Ok(());
    }
    write_file(target, &bytes)?;
    ctx.engine
        .log
        .debug(&format!("restored {}", target.display()));
    Ok(())
}
