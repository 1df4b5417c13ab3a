//! Staged resource identity and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the pipeline a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StagingCategory {
    /// Extracted at the origin, waiting to be sent or acknowledged.
    Outgoing,
    /// Received at the target, waiting to be applied.
    Incoming,
}

impl StagingCategory {
    /// Used for directory names and log output.
    pub fn as_str(&self) -> &str {
        match self {
            StagingCategory::Outgoing => "outgoing",
            StagingCategory::Incoming => "incoming",
        }
    }
}

impl std::fmt::Display for StagingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a staged resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    /// Being written. Never read back.
    Create,
    /// Complete and readable.
    Ready,
    /// The batch it holds was acknowledged. Eligible for purge.
    Done,
}

impl ResourceState {
    /// File extension used by the filesystem backend.
    pub fn as_str(&self) -> &str {
        match self {
            ResourceState::Create => "create",
            ResourceState::Ready => "ready",
            ResourceState::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ResourceState::Create),
            "ready" => Some(ResourceState::Ready),
            "done" => Some(ResourceState::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one staged payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagedResourceId {
    pub category: StagingCategory,
    /// Target node for outgoing resources, source node for incoming ones.
    pub node_id: String,
    pub batch_id: i64,
}

impl StagedResourceId {
    pub fn outgoing(node_id: impl Into<String>, batch_id: i64) -> Self {
        Self {
            category: StagingCategory::Outgoing,
            node_id: node_id.into(),
            batch_id,
        }
    }

    pub fn incoming(node_id: impl Into<String>, batch_id: i64) -> Self {
        Self {
            category: StagingCategory::Incoming,
            node_id: node_id.into(),
            batch_id,
        }
    }
}

impl std::fmt::Display for StagedResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.node_id, self.batch_id)
    }
}

/// Metadata about a staged payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedResource {
    pub id: StagedResourceId,
    pub state: ResourceState,
    pub byte_count: u64,
    pub last_update_time: DateTime<Utc>,
}
