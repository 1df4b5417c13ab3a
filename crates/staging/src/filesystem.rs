//! Filesystem-based staging implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::resource::{ResourceState, StagedResource, StagedResourceId, StagingCategory};
use crate::store::StagingArea;

/// Filesystem implementation of the StagingArea trait.
///
/// Payloads live at `<dir>/<category>/<node_id>/<batch_id>.<state>`. A
/// payload is written as `.create` and renamed to `.ready` once complete, so
/// a crash mid-write never leaves a readable partial payload.
pub struct FilesystemStagingArea {
    dir: PathBuf,
}

impl FilesystemStagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn node_dir(&self, id: &StagedResourceId) -> PathBuf {
        self.dir.join(id.category.as_str()).join(&id.node_id)
    }

    fn path(&self, id: &StagedResourceId, state: ResourceState) -> PathBuf {
        self.node_dir(id)
            .join(format!("{}.{}", id.batch_id, state.as_str()))
    }

    /// Locate the file backing a resource, whatever its state.
    async fn locate(&self, id: &StagedResourceId) -> Result<Option<(PathBuf, ResourceState)>> {
        for state in [ResourceState::Ready, ResourceState::Done, ResourceState::Create] {
            let path = self.path(id, state);
            if fs::try_exists(&path).await? {
                return Ok(Some((path, state)));
            }
        }
        Ok(None)
    }

    async fn describe(id: &StagedResourceId, path: &Path, state: ResourceState) -> Result<StagedResource> {
        let metadata = fs::metadata(path).await?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(StagedResource {
            id: id.clone(),
            state,
            byte_count: metadata.len(),
            last_update_time: modified,
        })
    }
}

#[async_trait]
impl StagingArea for FilesystemStagingArea {
    async fn write(&self, id: &StagedResourceId, payload: &[u8]) -> Result<StagedResource> {
        fs::create_dir_all(self.node_dir(id)).await?;
        if let Some((existing, _)) = self.locate(id).await? {
            fs::remove_file(existing).await?;
        }

        let creating = self.path(id, ResourceState::Create);
        fs::write(&creating, payload)
            .await
            .with_context(|| format!("Failed to stage {}", creating.display()))?;
        let ready = self.path(id, ResourceState::Ready);
        fs::rename(&creating, &ready).await?;

        tracing::debug!("Staged {} ({} bytes) at {}", id, payload.len(), ready.display());
        Self::describe(id, &ready, ResourceState::Ready).await
    }

    async fn read(&self, id: &StagedResourceId) -> Result<Option<Vec<u8>>> {
        match self.locate(id).await? {
            Some((_, ResourceState::Create)) | None => Ok(None),
            Some((path, _)) => Ok(Some(fs::read(path).await?)),
        }
    }

    async fn find(&self, id: &StagedResourceId) -> Result<Option<StagedResource>> {
        match self.locate(id).await? {
            Some((path, state)) => Ok(Some(Self::describe(id, &path, state).await?)),
            None => Ok(None),
        }
    }

    async fn set_state(&self, id: &StagedResourceId, state: ResourceState) -> Result<bool> {
        match self.locate(id).await? {
            Some((path, current)) => {
                if current != state {
                    fs::rename(path, self.path(id, state)).await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &StagedResourceId) -> Result<bool> {
        match self.locate(id).await? {
            Some((path, _)) => {
                fs::remove_file(path).await?;
                tracing::debug!("Deleted staged resource {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_done(&self) -> Result<usize> {
        let mut purged = 0;
        for category in [StagingCategory::Outgoing, StagingCategory::Incoming] {
            let category_dir = self.dir.join(category.as_str());
            if !fs::try_exists(&category_dir).await? {
                continue;
            }
            let mut nodes = fs::read_dir(&category_dir).await?;
            while let Some(node_entry) = nodes.next_entry().await? {
                if !node_entry.file_type().await?.is_dir() {
                    continue;
                }
                let mut entries = fs::read_dir(node_entry.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let is_done = path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .and_then(ResourceState::parse)
                        == Some(ResourceState::Done);
                    if is_done {
                        fs::remove_file(&path).await?;
                        purged += 1;
                    }
                }
            }
        }
        if purged > 0 {
            tracing::info!("Purged {} staged resources from {}", purged, self.dir.display());
        }
        Ok(purged)
    }
}
