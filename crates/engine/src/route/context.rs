//! State of one routing pass over one channel.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sync_core::{DataEvent, Node, NodeChannel, OutgoingBatch, RoutingTransaction, Store};

use super::column_match::ColumnMatchExpression;

/// Configuration tables touched by routed rows. Applied to the local caches
/// once the pass commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub channels: bool,
    pub trigger_routers: bool,
    pub nodes: bool,
}

impl ConfigChanges {
    pub fn any(&self) -> bool {
        self.channels || self.trigger_routers || self.nodes
    }
}

/// Counters reported at the end of a channel pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub data_count: usize,
    pub data_event_count: usize,
    pub unrouted_count: usize,
    pub batch_count: usize,
    pub commit_count: usize,
}

pub struct ChannelRouterContext {
    store: Arc<dyn Store>,
    pub channel: NodeChannel,
    pub produce_common_batches: bool,
    transaction: Option<Box<dyn RoutingTransaction>>,
    pub(crate) batches_by_node: HashMap<String, OutgoingBatch>,
    pending_events: Vec<DataEvent>,
    flush_size: usize,
    pub(crate) needs_commit: bool,
    uncommitted_data_ids: Vec<i64>,
    committed_data_ids: Vec<i64>,
    available_nodes: HashMap<String, Arc<Vec<Node>>>,
    expressions: HashMap<String, Arc<ColumnMatchExpression>>,
    lookup_tables: HashMap<String, Arc<HashMap<String, Vec<String>>>>,
    redirects: Option<Arc<HashMap<String, String>>>,
    pub config_changes: ConfigChanges,
    pub last_data_processed: Option<i64>,
    pub stats: RoutingStats,
    started: Instant,
}

impl ChannelRouterContext {
    pub fn new(store: Arc<dyn Store>, channel: NodeChannel, flush_size: usize) -> Self {
        Self {
            store,
            channel,
            produce_common_batches: false,
            transaction: None,
            batches_by_node: HashMap::new(),
            pending_events: Vec::new(),
            flush_size: flush_size.max(1),
            needs_commit: false,
            uncommitted_data_ids: Vec::new(),
            committed_data_ids: Vec::new(),
            available_nodes: HashMap::new(),
            expressions: HashMap::new(),
            lookup_tables: HashMap::new(),
            redirects: None,
            config_changes: ConfigChanges::default(),
            last_data_processed: None,
            stats: RoutingStats::default(),
            started: Instant::now(),
        }
    }

    pub fn channel_id(&self) -> &str {
        self.channel.channel_id()
    }

    pub fn elapsed_millis(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// The open routing transaction, started on first use after each commit.
    pub async fn transaction(&mut self) -> Result<&mut Box<dyn RoutingTransaction>> {
        let transaction = match self.transaction.take() {
            Some(transaction) => transaction,
            None => self.store.begin_routing().await?,
        };
        Ok(self.transaction.insert(transaction))
    }

    /// Record a data event, writing the pending set once it reaches the flush size.
    pub async fn add_data_event(&mut self, data_id: i64, batch_id: i64, router_id: &str) -> Result<()> {
        self.pending_events.push(DataEvent::new(data_id, batch_id, router_id));
        self.stats.data_event_count += 1;
        if self.pending_events.len() >= self.flush_size {
            self.flush_data_events().await?;
        }
        Ok(())
    }

    pub async fn flush_data_events(&mut self) -> Result<()> {
        if self.pending_events.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.pending_events);
        self.transaction().await?.insert_data_events(&events).await
    }

    pub fn record_routed(&mut self, data_id: i64) {
        self.uncommitted_data_ids.push(data_id);
        self.last_data_processed = Some(data_id);
        self.stats.data_count += 1;
    }

    /// Write pending events and commit. Data ids routed so far become committed.
    pub async fn commit(&mut self) -> Result<()> {
        self.flush_data_events().await?;
        if let Some(transaction) = self.transaction.take() {
            transaction.commit().await?;
            self.stats.commit_count += 1;
        }
        self.committed_data_ids.append(&mut self.uncommitted_data_ids);
        self.needs_commit = false;
        Ok(())
    }

    /// Discard everything since the last commit.
    pub async fn rollback(&mut self) {
        self.pending_events.clear();
        self.uncommitted_data_ids.clear();
        self.batches_by_node.clear();
        self.needs_commit = false;
        if let Some(transaction) = self.transaction.take() {
            if let Err(e) = transaction.rollback().await {
                tracing::error!("Failed to roll back routing of channel {}: {:#}", self.channel_id(), e);
            }
        }
    }

    pub fn committed_data_ids(&self) -> &[i64] {
        &self.committed_data_ids
    }

    pub fn available_nodes(&self, router_id: &str) -> Option<Arc<Vec<Node>>> {
        self.available_nodes.get(router_id).cloned()
    }

    pub fn cache_available_nodes(&mut self, router_id: &str, nodes: Vec<Node>) -> Arc<Vec<Node>> {
        let nodes = Arc::new(nodes);
        self.available_nodes
            .insert(router_id.to_string(), Arc::clone(&nodes));
        nodes
    }

    /// Parsed expression for a column-match router, parsed once per pass.
    pub fn column_expression(
        &mut self,
        router_id: &str,
        expression: &str,
    ) -> Result<Arc<ColumnMatchExpression>> {
        if let Some(parsed) = self.expressions.get(router_id) {
            return Ok(Arc::clone(parsed));
        }
        let parsed = Arc::new(ColumnMatchExpression::parse(router_id, expression)?);
        self.expressions
            .insert(router_id.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    pub fn lookup_table(&self, router_id: &str) -> Option<Arc<HashMap<String, Vec<String>>>> {
        self.lookup_tables.get(router_id).cloned()
    }

    pub fn cache_lookup_table(
        &mut self,
        router_id: &str,
        table: HashMap<String, Vec<String>>,
    ) -> Arc<HashMap<String, Vec<String>>> {
        let table = Arc::new(table);
        self.lookup_tables
            .insert(router_id.to_string(), Arc::clone(&table));
        table
    }

    pub fn redirects(&self) -> Option<Arc<HashMap<String, String>>> {
        self.redirects.clone()
    }

    pub fn cache_redirects(&mut self, redirects: HashMap<String, String>) -> Arc<HashMap<String, String>> {
        let redirects = Arc::new(redirects);
        self.redirects = Some(Arc::clone(&redirects));
        redirects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{Channel, MemoryStore, OutgoingBatchStatus};

    fn context(store: &MemoryStore, flush_size: usize) -> ChannelRouterContext {
        let channel = NodeChannel::new("000", Channel::new("default", 1));
        ChannelRouterContext::new(Arc::new(store.clone()), channel, flush_size)
    }

    #[tokio::test]
    async fn test_commit_applies_batches_and_events() {
        let store = MemoryStore::new();
        let mut ctx = context(&store, 10);

        let mut batch = OutgoingBatch::new("001", "default", OutgoingBatchStatus::Routing);
        ctx.transaction().await.unwrap().insert_outgoing_batch(&mut batch).await.unwrap();
        ctx.add_data_event(7, batch.batch_id, "r1").await.unwrap();
        ctx.record_routed(7);
        assert!(store.outgoing_batches().await.is_empty());

        ctx.commit().await.unwrap();
        assert_eq!(store.outgoing_batches().await.len(), 1);
        assert_eq!(store.data_events().await.len(), 1);
        assert_eq!(ctx.committed_data_ids(), &[7]);
        assert_eq!(ctx.stats.commit_count, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_uncommitted_work() {
        let store = MemoryStore::new();
        let mut ctx = context(&store, 1);

        let mut batch = OutgoingBatch::new("001", "default", OutgoingBatchStatus::Routing);
        ctx.transaction().await.unwrap().insert_outgoing_batch(&mut batch).await.unwrap();
        ctx.add_data_event(3, batch.batch_id, "r1").await.unwrap();
        ctx.record_routed(3);
        ctx.rollback().await;

        assert!(store.outgoing_batches().await.is_empty());
        assert!(store.data_events().await.is_empty());
        assert!(ctx.committed_data_ids().is_empty());
    }

    #[tokio::test]
    async fn test_column_expression_is_cached() {
        let store = MemoryStore::new();
        let mut ctx = context(&store, 10);
        let first = ctx.column_expression("r1", "A=:NODE_ID").unwrap();
        let second = ctx.column_expression("r1", "ignored").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(ctx.column_expression("r2", "nonsense").is_err());
    }
}
