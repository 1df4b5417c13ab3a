//! Staging area trait.

use anyhow::Result;
use async_trait::async_trait;

use crate::resource::{ResourceState, StagedResource, StagedResourceId};

/// Storage for batch payloads between extraction, transport and loading.
///
/// Implemented by:
/// - Filesystem storage (`FilesystemStagingArea`)
/// - In-process memory (`MemoryStagingArea`)
#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Store a complete payload and mark it `Ready`, replacing any previous content.
    async fn write(&self, id: &StagedResourceId, payload: &[u8]) -> Result<StagedResource>;

    /// Read a payload. Returns None unless the resource is `Ready` or `Done`.
    async fn read(&self, id: &StagedResourceId) -> Result<Option<Vec<u8>>>;

    /// Look up a resource's metadata.
    async fn find(&self, id: &StagedResourceId) -> Result<Option<StagedResource>>;

    /// Move a resource to another state. Returns false if it does not exist.
    async fn set_state(&self, id: &StagedResourceId, state: ResourceState) -> Result<bool>;

    /// Remove a resource. Returns false if it did not exist.
    async fn delete(&self, id: &StagedResourceId) -> Result<bool>;

    /// Remove every `Done` resource, returning how many were removed.
    async fn purge_done(&self) -> Result<usize>;
}
