//! In-memory staging implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::resource::{ResourceState, StagedResource, StagedResourceId};
use crate::store::StagingArea;

/// Staging area that keeps payloads in a map. Contents are lost on exit.
#[derive(Clone, Default)]
pub struct MemoryStagingArea {
    resources: Arc<Mutex<HashMap<StagedResourceId, (StagedResource, Vec<u8>)>>>,
}

impl MemoryStagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.resources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.lock().await.is_empty()
    }
}

#[async_trait]
impl StagingArea for MemoryStagingArea {
    async fn write(&self, id: &StagedResourceId, payload: &[u8]) -> Result<StagedResource> {
        let resource = StagedResource {
            id: id.clone(),
            state: ResourceState::Ready,
            byte_count: payload.len() as u64,
            last_update_time: Utc::now(),
        };
        self.resources
            .lock()
            .await
            .insert(id.clone(), (resource.clone(), payload.to_vec()));
        Ok(resource)
    }

    async fn read(&self, id: &StagedResourceId) -> Result<Option<Vec<u8>>> {
        let resources = self.resources.lock().await;
        Ok(resources
            .get(id)
            .filter(|(resource, _)| resource.state != ResourceState::Create)
            .map(|(_, payload)| payload.clone()))
    }

    async fn find(&self, id: &StagedResourceId) -> Result<Option<StagedResource>> {
        Ok(self
            .resources
            .lock()
            .await
            .get(id)
            .map(|(resource, _)| resource.clone()))
    }

    async fn set_state(&self, id: &StagedResourceId, state: ResourceState) -> Result<bool> {
        let mut resources = self.resources.lock().await;
        match resources.get_mut(id) {
            Some((resource, _)) => {
                resource.state = state;
                resource.last_update_time = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &StagedResourceId) -> Result<bool> {
        Ok(self.resources.lock().await.remove(id).is_some())
    }

    async fn purge_done(&self) -> Result<usize> {
        let mut resources = self.resources.lock().await;
        let before = resources.len();
        resources.retain(|_, (resource, _)| resource.state != ResourceState::Done);
        Ok(before - resources.len())
    }
}
