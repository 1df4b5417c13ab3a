//! Core types for symmetric-sync.
//!
//! This crate provides the replication model shared by every other crate:
//!
//! - [`Data`] - captured change rows and the [`TriggerHistory`] that describes their shape
//! - [`OutgoingBatch`] / [`IncomingBatch`] - batch records and their status machines
//! - [`SyncError`] - the error taxonomy
//! - [`Store`] - persistence traits, with [`MemoryStore`] as the in-process backend
//! - [`Topology`] - nodes, channels and routing rules loaded from YAML
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── symmetric-sync-protocol    (batch payload codec)
//!    ├─── staging                    (staged batch payloads)
//!    ├─── symmetric-sync-engine      (routing, extraction, loading)
//!    └─── symmetric-sync-postgresql  (PostgreSQL store and writer)
//! ```

pub mod batch;
pub mod error;
pub mod memory;
pub mod model;
pub mod row;
pub mod store;
pub mod topology;

// Re-exports for convenience
pub use batch::{
    AckStatus, BatchAck, IncomingBatch, IncomingBatchStatus, IncomingError, OutgoingBatch,
    OutgoingBatchStatus,
};
pub use error::{ErrorCategory, SqlError, SyncError, CONFLICT_STATE};
pub use memory::MemoryStore;
pub use model::{
    qualify, Channel, Data, DataEvent, DataEventType, DataGap, Node, NodeChannel,
    NodeChannelControl, NodeGroupLink, NodeGroupLinkAction, Router, RowValues, Trigger,
    TriggerHistory, TriggerRouter, CHANNEL_CONFIG, CHANNEL_DEFAULT, CHANNEL_HEARTBEAT,
    CHANNEL_RELOAD, UNKNOWN_ROUTER_ID, UNROUTED_NODE_ID,
};
pub use store::{
    ConfigStore, DataGapStore, DataRange, DataStore, IncomingBatchStore, LockStore,
    OutgoingBatchStore, RoutingStore, RoutingTransaction, Store,
};
pub use topology::{Topology, TopologyError};
