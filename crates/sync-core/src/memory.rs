//! In-memory implementation of every store trait.
//!
//! Used by tests and by single-process setups that do not need durability.
//! Routing transactions buffer their writes and apply them on commit, so a
//! rolled back pass leaves no batch or data event behind.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::batch::{IncomingBatch, IncomingError, OutgoingBatch, OutgoingBatchStatus};
use crate::model::{
    Channel, Data, DataEvent, DataGap, Node, NodeChannelControl, NodeGroupLink, TriggerHistory,
    TriggerRouter,
};
use crate::store::{
    ConfigStore, DataGapStore, DataRange, DataStore, IncomingBatchStore, LockStore,
    OutgoingBatchStore, RoutingStore, RoutingTransaction,
};

#[derive(Debug, Default)]
struct LockRow {
    locking_server_id: Option<String>,
    lock_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<Node>,
    links: Vec<NodeGroupLink>,
    channels: Vec<Channel>,
    node_channel_controls: Vec<NodeChannelControl>,
    trigger_routers: Vec<TriggerRouter>,
    trigger_histories: Vec<TriggerHistory>,
    data: BTreeMap<i64, Data>,
    data_events: BTreeSet<(i64, i64, String)>,
    gaps: BTreeSet<DataGap>,
    outgoing: BTreeMap<(i64, String), OutgoingBatch>,
    incoming: BTreeMap<(i64, String), IncomingBatch>,
    incoming_errors: Vec<IncomingError>,
    locks: HashMap<String, LockRow>,
    next_data_id: i64,
    next_batch_id: i64,
    next_trigger_hist_id: i64,
}

impl State {
    fn next_batch_id(&mut self) -> i64 {
        self.next_batch_id += 1;
        self.next_batch_id
    }
}

/// Volatile store backed by ordered maps behind an async mutex.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    fail_data_event_inserts: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent data event insert fail. Used to exercise rollback paths.
    pub fn set_fail_data_event_inserts(&self, fail: bool) {
        self.fail_data_event_inserts.store(fail, Ordering::SeqCst);
    }

    /// Reserve `count` change log ids without writing rows, as an aborted capture transaction would.
    pub async fn reserve_data_ids(&self, count: i64) -> i64 {
        let mut state = self.state.lock().await;
        let first = state.next_data_id + 1;
        state.next_data_id += count;
        first
    }

    /// Snapshot of all outgoing batches, ordered by (batch id, node id).
    pub async fn outgoing_batches(&self) -> Vec<OutgoingBatch> {
        self.state.lock().await.outgoing.values().cloned().collect()
    }

    /// Snapshot of all incoming batches.
    pub async fn incoming_batches(&self) -> Vec<IncomingBatch> {
        self.state.lock().await.incoming.values().cloned().collect()
    }

    /// Snapshot of all data events.
    pub async fn data_events(&self) -> Vec<DataEvent> {
        self.state
            .lock()
            .await
            .data_events
            .iter()
            .map(|(batch_id, data_id, router_id)| DataEvent::new(*data_id, *batch_id, router_id))
            .collect()
    }

    /// Current holder of a named lock.
    pub async fn lock_holder(&self, action: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .locks
            .get(action)
            .and_then(|row| row.locking_server_id.clone())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().await.nodes.clone())
    }

    async fn save_node(&self, node: &Node) -> Result<()> {
        let mut state = self.state.lock().await;
        state.nodes.retain(|n| n.node_id != node.node_id);
        state.nodes.push(node.clone());
        Ok(())
    }

    async fn node_group_links(&self) -> Result<Vec<NodeGroupLink>> {
        Ok(self.state.lock().await.links.clone())
    }

    async fn save_node_group_link(&self, link: &NodeGroupLink) -> Result<()> {
        let mut state = self.state.lock().await;
        state.links.retain(|l| {
            l.source_node_group_id != link.source_node_group_id
                || l.target_node_group_id != link.target_node_group_id
        });
        state.links.push(link.clone());
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<Channel>> {
        Ok(self.state.lock().await.channels.clone())
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channels.retain(|c| c.channel_id != channel.channel_id);
        state.channels.push(channel.clone());
        Ok(())
    }

    async fn node_channel_controls(&self, node_id: &str) -> Result<Vec<NodeChannelControl>> {
        Ok(self
            .state
            .lock()
            .await
            .node_channel_controls
            .iter()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn save_node_channel_control(&self, control: &NodeChannelControl) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .node_channel_controls
            .retain(|c| c.node_id != control.node_id || c.channel_id != control.channel_id);
        state.node_channel_controls.push(control.clone());
        Ok(())
    }

    async fn trigger_routers(&self) -> Result<Vec<TriggerRouter>> {
        Ok(self.state.lock().await.trigger_routers.clone())
    }

    async fn save_trigger_router(&self, trigger_router: &TriggerRouter) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = trigger_router.id();
        state.trigger_routers.retain(|tr| tr.id() != id);
        state.trigger_routers.push(trigger_router.clone());
        Ok(())
    }

    async fn trigger_histories(&self) -> Result<Vec<TriggerHistory>> {
        Ok(self.state.lock().await.trigger_histories.clone())
    }

    async fn save_trigger_history(&self, history: &TriggerHistory) -> Result<i64> {
        let mut state = self.state.lock().await;
        let mut history = history.clone();
        if history.trigger_hist_id <= 0 {
            state.next_trigger_hist_id += 1;
            history.trigger_hist_id = state.next_trigger_hist_id;
        } else {
            state.next_trigger_hist_id = state.next_trigger_hist_id.max(history.trigger_hist_id);
        }
        let id = history.trigger_hist_id;
        state.trigger_histories.retain(|h| h.trigger_hist_id != id);
        state.trigger_histories.push(history);
        Ok(id)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn insert_data(&self, data: &Data) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_data_id += 1;
        let id = state.next_data_id;
        let mut data = data.clone();
        data.data_id = id;
        state.data.insert(id, data);
        Ok(id)
    }

    async fn select_data(
        &self,
        channel_id: &str,
        range: &DataRange,
        after_data_id: i64,
        limit: usize,
    ) -> Result<Vec<Data>> {
        let state = self.state.lock().await;
        Ok(state
            .data
            .range(after_data_id.saturating_add(1)..)
            .map(|(_, data)| data)
            .filter(|data| data.channel_id == channel_id && range.contains(data.data_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn select_routed_data_ids(&self, start_id: i64, end_id: i64) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        let ids: BTreeSet<i64> = state
            .data_events
            .iter()
            .map(|(_, data_id, _)| *data_id)
            .filter(|id| *id >= start_id && *id <= end_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn count_data_in_range(&self, start_id: i64, end_id: i64) -> Result<i64> {
        if end_id - start_id < 2 {
            return Ok(0);
        }
        let state = self.state.lock().await;
        Ok(state.data.range(start_id + 1..end_id).count() as i64)
    }

    async fn min_data_id(&self) -> Result<Option<i64>> {
        Ok(self.state.lock().await.data.keys().next().copied())
    }

    async fn max_data_id(&self) -> Result<Option<i64>> {
        Ok(self.state.lock().await.data.keys().next_back().copied())
    }

    async fn max_routed_data_id(&self) -> Result<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state.data_events.iter().map(|(_, data_id, _)| *data_id).max())
    }

    async fn select_data_for_batch(&self, batch_id: i64) -> Result<Vec<Data>> {
        let ids = self.select_data_ids_for_batch(batch_id).await?;
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.data.get(id).cloned())
            .collect())
    }

    async fn select_data_ids_for_batch(&self, batch_id: i64) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        let ids: BTreeSet<i64> = state
            .data_events
            .range((batch_id, i64::MIN, String::new())..)
            .take_while(|(b, _, _)| *b == batch_id)
            .map(|(_, data_id, _)| *data_id)
            .collect();
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl DataGapStore for MemoryStore {
    async fn data_gaps(&self) -> Result<Vec<DataGap>> {
        Ok(self.state.lock().await.gaps.iter().cloned().collect())
    }

    async fn replace_data_gaps(&self, deleted: &[DataGap], added: &[DataGap]) -> Result<()> {
        let mut state = self.state.lock().await;
        for gap in deleted {
            state.gaps.remove(gap);
        }
        for gap in added {
            state.gaps.insert(gap.clone());
        }
        Ok(())
    }
}

/// Routing transaction that applies its writes on commit.
struct MemoryRoutingTransaction {
    state: Arc<Mutex<State>>,
    fail_data_event_inserts: Arc<AtomicBool>,
    batches: BTreeMap<(i64, String), OutgoingBatch>,
    events: Vec<DataEvent>,
}

#[async_trait]
impl RoutingTransaction for MemoryRoutingTransaction {
    async fn insert_outgoing_batch(&mut self, batch: &mut OutgoingBatch) -> Result<()> {
        if batch.batch_id <= 0 {
            batch.batch_id = self.state.lock().await.next_batch_id();
        }
        let key = (batch.batch_id, batch.node_id.clone());
        if self.batches.contains_key(&key) || self.state.lock().await.outgoing.contains_key(&key)
        {
            bail!(
                "Outgoing batch {} for node {} already exists",
                batch.batch_id,
                batch.node_id
            );
        }
        self.batches.insert(key, batch.clone());
        Ok(())
    }

    async fn update_outgoing_batch(&mut self, batch: &OutgoingBatch) -> Result<()> {
        let key = (batch.batch_id, batch.node_id.clone());
        let mut batch = batch.clone();
        batch.last_update_time = Some(Utc::now());
        self.batches.insert(key, batch);
        Ok(())
    }

    async fn insert_data_events(&mut self, events: &[DataEvent]) -> Result<()> {
        if self.fail_data_event_inserts.load(Ordering::SeqCst) {
            bail!("Simulated failure inserting {} data events", events.len());
        }
        self.events.extend_from_slice(events);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, batch) in self.batches {
            state.outgoing.insert(key, batch);
        }
        for event in self.events {
            state
                .data_events
                .insert((event.batch_id, event.data_id, event.router_id));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RoutingStore for MemoryStore {
    async fn begin_routing(&self) -> Result<Box<dyn RoutingTransaction>> {
        Ok(Box::new(MemoryRoutingTransaction {
            state: Arc::clone(&self.state),
            fail_data_event_inserts: Arc::clone(&self.fail_data_event_inserts),
            batches: BTreeMap::new(),
            events: Vec::new(),
        }))
    }
}

#[async_trait]
impl OutgoingBatchStore for MemoryStore {
    async fn insert_outgoing_batch(&self, batch: &mut OutgoingBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        if batch.batch_id <= 0 {
            batch.batch_id = state.next_batch_id();
        }
        state
            .outgoing
            .insert((batch.batch_id, batch.node_id.clone()), batch.clone());
        Ok(())
    }

    async fn update_outgoing_batch(&self, batch: &OutgoingBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (batch.batch_id, batch.node_id.clone());
        if !state.outgoing.contains_key(&key) {
            bail!(
                "Cannot update outgoing batch {} for node {}: not found",
                batch.batch_id,
                batch.node_id
            );
        }
        let mut batch = batch.clone();
        batch.last_update_time = Some(Utc::now());
        state.outgoing.insert(key, batch);
        Ok(())
    }

    async fn find_outgoing_batch(
        &self,
        batch_id: i64,
        node_id: &str,
    ) -> Result<Option<OutgoingBatch>> {
        let state = self.state.lock().await;
        Ok(state.outgoing.get(&(batch_id, node_id.to_string())).cloned())
    }

    async fn select_outgoing_batches(
        &self,
        node_id: &str,
        statuses: &[OutgoingBatchStatus],
        limit: usize,
    ) -> Result<Vec<OutgoingBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .outgoing
            .values()
            .filter(|b| b.node_id == node_id && statuses.contains(&b.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn select_outgoing_batches_by_status(
        &self,
        statuses: &[OutgoingBatchStatus],
    ) -> Result<Vec<OutgoingBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .outgoing
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    async fn mark_all_as_sent_for_node(&self, node_id: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for batch in state.outgoing.values_mut() {
            if batch.node_id == node_id && batch.status != OutgoingBatchStatus::Ok {
                batch.status = OutgoingBatchStatus::Ok;
                batch.error_flag = false;
                batch.last_update_time = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl IncomingBatchStore for MemoryStore {
    async fn find_incoming_batch(
        &self,
        batch_id: i64,
        node_id: &str,
    ) -> Result<Option<IncomingBatch>> {
        let state = self.state.lock().await;
        Ok(state.incoming.get(&(batch_id, node_id.to_string())).cloned())
    }

    async fn insert_incoming_batch(&self, batch: &IncomingBatch) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (batch.batch_id, batch.node_id.clone());
        if state.incoming.contains_key(&key) {
            return Ok(false);
        }
        state.incoming.insert(key, batch.clone());
        Ok(true)
    }

    async fn update_incoming_batch(&self, batch: &IncomingBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut batch = batch.clone();
        batch.last_update_time = Some(Utc::now());
        state
            .incoming
            .insert((batch.batch_id, batch.node_id.clone()), batch);
        Ok(())
    }

    async fn insert_incoming_error(&self, error: &IncomingError) -> Result<()> {
        self.state.lock().await.incoming_errors.push(error.clone());
        Ok(())
    }

    async fn incoming_errors(&self, batch_id: i64, node_id: &str) -> Result<Vec<IncomingError>> {
        let state = self.state.lock().await;
        Ok(state
            .incoming_errors
            .iter()
            .filter(|e| e.batch_id == batch_id && e.node_id == node_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn init_lock(&self, action: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .locks
            .entry(action.to_string())
            .or_default();
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        action: &str,
        server_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let row = state.locks.entry(action.to_string()).or_default();
        let free = match (&row.locking_server_id, row.lock_time) {
            (None, _) | (_, None) => true,
            (Some(holder), Some(time)) => holder == server_id || time < stale_before,
        };
        if free {
            row.locking_server_id = Some(server_id.to_string());
            row.lock_time = Some(now);
        }
        Ok(free)
    }

    async fn release_lock(&self, action: &str, server_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get_mut(action) {
            Some(row) if row.locking_server_id.as_deref() == Some(server_id) => {
                row.locking_server_id = None;
                row.lock_time = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
