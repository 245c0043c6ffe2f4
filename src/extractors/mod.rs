//! State extractors: capture, apply and remove per item category.
//!
//! Each category has one [`Extractor`]; the free functions [`capture`],
//! [`apply`], [`remove`] and [`skip_reason`] dispatch over the closed
//! [`Item`] enum.
pub mod application;
mod error;
pub mod file;
pub mod helpers;
pub mod registry;
pub mod registry_store;

use std::collections::BTreeSet;

pub use application::{ApplicationExtractor, PackageEntry};
pub use error::ItemError;
pub use file::FileExtractor;
pub use registry::{RegistryArtifact, RegistryExtractor};
pub use registry_store::{FileRegistry, PowerShellRegistry, RegistryData, RegistryStore};

use crate::engine::{EngineContext, OperationKind};
use crate::snapshot::{ArtifactRecord, Snapshot};
use crate::template::{Item, ItemCommon};
use crate::warning::Warning;

/// Everything an extractor needs besides the item.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    /// Engine services.
    pub engine: &'a EngineContext,
    /// Snapshot being written or read.
    pub snapshot: &'a Snapshot,
    /// Names of prerequisites that evaluated missing.
    pub missing_prereqs: &'a BTreeSet<String>,
}

/// Per-category capture/apply/remove behaviour.
pub trait Extractor {
    /// Item type handled.
    type Item;

    /// Reason to skip the item for `operation`, if any.
    fn skip_reason(
        &self,
        _item: &Self::Item,
        _operation: OperationKind,
        _record: Option<&ArtifactRecord>,
        _ctx: &ExtractContext<'_>,
    ) -> Option<String> {
        None
    }

    /// Capture host state into the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError`] if the state cannot be read or written.
    fn capture(
        &self,
        item: &Self::Item,
        ctx: &ExtractContext<'_>,
    ) -> Result<ArtifactRecord, ItemError>;

    /// Apply captured state to the host.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError`] if the artifact is missing or unusable, or the
    /// host cannot be changed.
    fn apply(
        &self,
        item: &Self::Item,
        record: Option<&ArtifactRecord>,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Warning>, ItemError>;

    /// Undo captured state on the host.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::UnsupportedOperation`] unless the category
    /// supports removal.
    fn remove(
        &self,
        _item: &Self::Item,
        _record: Option<&ArtifactRecord>,
        _ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Warning>, ItemError> {
        Err(ItemError::UnsupportedOperation {
            operation: "remove",
            category: self.category_name(),
        })
    }

    /// Category name for messages.
    fn category_name(&self) -> &'static str;
}

/// Capture `item` into the snapshot.
///
/// # Errors
///
/// Returns the extractor's [`ItemError`].
pub fn capture(item: &Item, ctx: &ExtractContext<'_>) -> Result<ArtifactRecord, ItemError> {
    match item {
        Item::File(f) => FileExtractor.capture(f, ctx),
        Item::Registry(r) => RegistryExtractor.capture(r, ctx),
        Item::Application(a) => ApplicationExtractor.capture(a, ctx),
    }
}

/// Apply `item` from its artifact record.
///
/// # Errors
///
/// Returns the extractor's [`ItemError`].
pub fn apply(
    item: &Item,
    record: Option<&ArtifactRecord>,
    ctx: &ExtractContext<'_>,
) -> Result<Vec<Warning>, ItemError> {
    match item {
        Item::File(f) => FileExtractor.apply(f, record, ctx),
        Item::Registry(r) => RegistryExtractor.apply(r, record, ctx),
        Item::Application(a) => ApplicationExtractor.apply(a, record, ctx),
    }
}

/// Remove `item` using its artifact record.
///
/// # Errors
///
/// Returns the extractor's [`ItemError`].
pub fn remove(
    item: &Item,
    record: Option<&ArtifactRecord>,
    ctx: &ExtractContext<'_>,
) -> Result<Vec<Warning>, ItemError> {
    match item {
        Item::File(f) => FileExtractor.remove(f, record, ctx),
        Item::Registry(r) => RegistryExtractor.remove(r, record, ctx),
        Item::Application(a) => ApplicationExtractor.remove(a, record, ctx),
    }
}

/// Reason to skip `item` for `operation` before dispatching, if any.
#[must_use]
pub fn skip_reason(
    item: &Item,
    operation: OperationKind,
    record: Option<&ArtifactRecord>,
    ctx: &ExtractContext<'_>,
) -> Option<String> {
    match item {
        Item::File(f) => FileExtractor.skip_reason(f, operation, record, ctx),
        Item::Registry(r) => RegistryExtractor.skip_reason(r, operation, record, ctx),
        Item::Application(a) => ApplicationExtractor.skip_reason(a, operation, record, ctx),
    }
}

/// The item's `dynamic_state_path`, required for capture.
fn state_path(common: &ItemCommon) -> Result<&str, ItemError> {
    common
        .dynamic_state_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ItemError::Parse(format!("'{}' has no dynamic_state_path", common.name)))
}
