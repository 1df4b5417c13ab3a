//! Persistence traits for the runtime tables.
//!
//! The engine never touches tables directly. Every backend (the in-memory
//! [`MemoryStore`](crate::MemoryStore), the PostgreSQL store) implements
//! these traits, and [`Store`] ties them together so services can share a
//! single `Arc<dyn Store>`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::{IncomingBatch, IncomingError, OutgoingBatch, OutgoingBatchStatus};
use crate::model::{
    Channel, Data, DataEvent, DataGap, Node, NodeChannelControl, NodeGroupLink, TriggerHistory,
    TriggerRouter,
};

/// Which change log ids a reader pass selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRange {
    /// Ids inside any of the listed inclusive ranges.
    Ranges(Vec<(i64, i64)>),
    /// Ids greater than or equal to the given id.
    StartingAt(i64),
}

impl DataRange {
    pub fn contains(&self, data_id: i64) -> bool {
        match self {
            DataRange::Ranges(ranges) => ranges
                .iter()
                .any(|(start, end)| data_id >= *start && data_id <= *end),
            DataRange::StartingAt(start) => data_id >= *start,
        }
    }
}

/// Configuration entities: topology, channels and routing rules.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn nodes(&self) -> Result<Vec<Node>>;
    async fn save_node(&self, node: &Node) -> Result<()>;

    async fn node_group_links(&self) -> Result<Vec<NodeGroupLink>>;
    async fn save_node_group_link(&self, link: &NodeGroupLink) -> Result<()>;

    async fn channels(&self) -> Result<Vec<Channel>>;
    async fn save_channel(&self, channel: &Channel) -> Result<()>;

    async fn node_channel_controls(&self, node_id: &str) -> Result<Vec<NodeChannelControl>>;
    async fn save_node_channel_control(&self, control: &NodeChannelControl) -> Result<()>;

    async fn trigger_routers(&self) -> Result<Vec<TriggerRouter>>;
    async fn save_trigger_router(&self, trigger_router: &TriggerRouter) -> Result<()>;

    async fn trigger_histories(&self) -> Result<Vec<TriggerHistory>>;
    /// Insert a history, assigning an id when `trigger_hist_id` is not positive.
    async fn save_trigger_history(&self, history: &TriggerHistory) -> Result<i64>;
}

/// The change log.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Append a change row and return its id.
    async fn insert_data(&self, data: &Data) -> Result<i64>;

    /// Rows of a channel within `range` with `data_id > after_data_id`, in id order.
    async fn select_data(
        &self,
        channel_id: &str,
        range: &DataRange,
        after_data_id: i64,
        limit: usize,
    ) -> Result<Vec<Data>>;

    /// Distinct change row ids already associated with a batch, within an inclusive range.
    async fn select_routed_data_ids(&self, start_id: i64, end_id: i64) -> Result<Vec<i64>>;

    /// Number of change rows with `start_id < data_id < end_id`.
    async fn count_data_in_range(&self, start_id: i64, end_id: i64) -> Result<i64>;

    async fn min_data_id(&self) -> Result<Option<i64>>;
    async fn max_data_id(&self) -> Result<Option<i64>>;
    async fn max_routed_data_id(&self) -> Result<Option<i64>>;

    /// Change rows of a batch in id order.
    async fn select_data_for_batch(&self, batch_id: i64) -> Result<Vec<Data>>;

    /// Change row ids of a batch in id order.
    async fn select_data_ids_for_batch(&self, batch_id: i64) -> Result<Vec<i64>>;
}

/// Persisted data gaps.
#[async_trait]
pub trait DataGapStore: Send + Sync {
    async fn data_gaps(&self) -> Result<Vec<DataGap>>;

    /// Delete then insert gaps in a single transaction.
    async fn replace_data_gaps(&self, deleted: &[DataGap], added: &[DataGap]) -> Result<()>;
}

/// Transaction spanning one channel's routing pass.
#[async_trait]
pub trait RoutingTransaction: Send + Sync {
    /// Insert a batch. A store sequence id is assigned when `batch_id` is not positive.
    async fn insert_outgoing_batch(&mut self, batch: &mut OutgoingBatch) -> Result<()>;
    async fn update_outgoing_batch(&mut self, batch: &OutgoingBatch) -> Result<()>;
    async fn insert_data_events(&mut self, events: &[DataEvent]) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Source of routing transactions.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn begin_routing(&self) -> Result<Box<dyn RoutingTransaction>>;
}

/// Outgoing batch bookkeeping outside routing.
#[async_trait]
pub trait OutgoingBatchStore: Send + Sync {
    async fn insert_outgoing_batch(&self, batch: &mut OutgoingBatch) -> Result<()>;
    async fn update_outgoing_batch(&self, batch: &OutgoingBatch) -> Result<()>;
    async fn find_outgoing_batch(&self, batch_id: i64, node_id: &str)
        -> Result<Option<OutgoingBatch>>;
    /// Batches for a node in the given statuses, ordered by batch id.
    async fn select_outgoing_batches(
        &self,
        node_id: &str,
        statuses: &[OutgoingBatchStatus],
        limit: usize,
    ) -> Result<Vec<OutgoingBatch>>;
    async fn select_outgoing_batches_by_status(
        &self,
        statuses: &[OutgoingBatchStatus],
    ) -> Result<Vec<OutgoingBatch>>;
    /// Set every unfinished batch of a node to `OK`, returning how many changed.
    async fn mark_all_as_sent_for_node(&self, node_id: &str) -> Result<u64>;
}

/// Incoming batch bookkeeping on the receiving node.
#[async_trait]
pub trait IncomingBatchStore: Send + Sync {
    async fn find_incoming_batch(&self, batch_id: i64, node_id: &str)
        -> Result<Option<IncomingBatch>>;
    /// Insert unless a row for the same (batch, node) exists. Returns whether it was inserted.
    async fn insert_incoming_batch(&self, batch: &IncomingBatch) -> Result<bool>;
    async fn update_incoming_batch(&self, batch: &IncomingBatch) -> Result<()>;
    async fn insert_incoming_error(&self, error: &IncomingError) -> Result<()>;
    async fn incoming_errors(&self, batch_id: i64, node_id: &str) -> Result<Vec<IncomingError>>;
}

/// Cluster-wide named locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Make sure a lock row exists for `action`.
    async fn init_lock(&self, action: &str) -> Result<()>;

    /// Take the lock if it is free, already ours, or older than `stale_before`.
    async fn try_acquire_lock(
        &self,
        action: &str,
        server_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Release a lock held by `server_id`. Returns false if it was not held by us.
    async fn release_lock(&self, action: &str, server_id: &str) -> Result<bool>;
}

/// Everything the engine needs from a backend.
pub trait Store:
    ConfigStore
    + DataStore
    + DataGapStore
    + RoutingStore
    + OutgoingBatchStore
    + IncomingBatchStore
    + LockStore
{
}

impl<T> Store for T where
    T: ConfigStore
        + DataStore
        + DataGapStore
        + RoutingStore
        + OutgoingBatchStore
        + IncomingBatchStore
        + LockStore
{
}
