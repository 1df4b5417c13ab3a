//! The routing job: assigns captured change rows to outgoing batches.

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use sync_core::{
    Data, DataGap, Node, NodeChannel, OutgoingBatch, OutgoingBatchStatus, Store, SyncError,
    TriggerRouter, CHANNEL_CONFIG, CHANNEL_HEARTBEAT, CHANNEL_RELOAD, UNKNOWN_ROUTER_ID,
    UNROUTED_NODE_ID,
};

use super::batch_algorithm::BatchAlgorithm;
use super::context::ChannelRouterContext;
use super::data_router::{DataMetaData, DataRouter, RouterLookup, ScriptedRouter, StaticRouterLookup};
use super::gap::DataGapDetector;
use super::reader::{DataGapRouteReader, ReaderSettings};
use crate::cluster::{self, ClusterService};
use crate::config::ConfigurationService;
use crate::params::EngineParameters;

/// Routes change rows into outgoing batches, one channel at a time.
pub struct RouterService {
    store: Arc<dyn Store>,
    config: Arc<ConfigurationService>,
    cluster: Arc<ClusterService>,
    detector: DataGapDetector,
    params: EngineParameters,
    lookup: Arc<dyn RouterLookup>,
    scripts: HashMap<String, ScriptedRouter>,
    running: Mutex<()>,
    greater_query_in_use: Arc<AtomicBool>,
    common_batch_modes: Mutex<HashMap<String, bool>>,
}

impl RouterService {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigurationService>,
        cluster: Arc<ClusterService>,
        params: &EngineParameters,
    ) -> Self {
        Self {
            detector: DataGapDetector::new(Arc::clone(&store), params),
            store,
            config,
            cluster,
            params: params.clone(),
            lookup: Arc::new(StaticRouterLookup::new()),
            scripts: HashMap::new(),
            running: Mutex::new(()),
            greater_query_in_use: Arc::new(AtomicBool::new(false)),
            common_batch_modes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn RouterLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Register a scripted router under a router type name.
    pub fn with_scripted_router(mut self, name: impl Into<String>, router: ScriptedRouter) -> Self {
        self.scripts.insert(name.into(), router);
        self
    }

    pub fn gap_detector(&self) -> &DataGapDetector {
        &self.detector
    }

    /// Run one routing pass. Returns `None` when another pass holds the lock.
    pub async fn route_data(&self) -> Result<Option<usize>> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Did not run the routing process because it is already running");
            return Ok(None);
        };
        let routed = self
            .cluster
            .with_lock(cluster::ROUTE, self.route_all_channels())
            .await?;
        if routed.is_none() {
            tracing::debug!("Did not run the routing process because the cluster service has it locked");
        }
        Ok(routed)
    }

    async fn route_all_channels(&self) -> Result<usize> {
        let started = Instant::now();
        self.complete_abandoned_batches().await?;

        let gaps = self.detector.before_routing().await?;
        let local_node_id = self.config.identity().node_id.clone();
        let channels = self.config.node_channels(&local_node_id).await?;
        let mut data_count = 0;
        for channel in channels.iter() {
            if channel.suspend_enabled || !channel.is_enabled() {
                continue;
            }
            data_count += self.route_channel(channel.clone(), &gaps).await;
        }
        self.detector.after_routing().await?;

        if data_count > 0 {
            tracing::info!(
                "Routed {} data events in {} ms",
                data_count,
                started.elapsed().as_millis()
            );
        }
        Ok(data_count)
    }

    /// Batches still in `RT` were left by a pass that died before committing.
    async fn complete_abandoned_batches(&self) -> Result<()> {
        let abandoned = self
            .store
            .select_outgoing_batches_by_status(&[OutgoingBatchStatus::Routing])
            .await?;
        if abandoned.is_empty() {
            return Ok(());
        }
        tracing::info!("Found {} abandoned routing batches", abandoned.len());
        for mut batch in abandoned {
            batch.force_ok();
            self.store.update_outgoing_batch(&batch).await?;
        }
        Ok(())
    }

    /// Route one channel. Failures are logged and roll back the uncommitted part.
    async fn route_channel(&self, channel: NodeChannel, gaps: &[DataGap]) -> usize {
        let mut context = ChannelRouterContext::new(
            Arc::clone(&self.store),
            channel,
            self.params.routing_flush_jdbc_batch_size,
        );

        match self.select_data_and_route(&mut context, gaps).await {
            Ok(all_data_read) => self.detector.set_all_data_read(all_data_read).await,
            Err(e) => {
                context.rollback().await;
                self.detector.set_all_data_read(false).await;
                if matches!(SyncError::find(&e), Some(SyncError::RouterSyntax { .. })) {
                    tracing::error!(
                        "Failed to route and batch data on '{}' channel due to an invalid router expression: {:#}",
                        context.channel_id(),
                        e
                    );
                } else {
                    tracing::error!(
                        "Failed to route and batch data on '{}' channel: {:#}",
                        context.channel_id(),
                        e
                    );
                }
            }
        }

        self.apply_config_changes(&context).await;
        let committed = context.committed_data_ids();
        self.detector.add_data_ids(committed).await;
        tracing::debug!(
            "Routed {} of {} rows on channel {} ({} data events, {} unrouted, {} commits)",
            committed.len(),
            context.stats.data_count,
            context.channel_id(),
            context.stats.data_event_count,
            context.stats.unrouted_count,
            context.stats.commit_count
        );
        committed.len()
    }

    async fn apply_config_changes(&self, context: &ChannelRouterContext) {
        let changes = context.config_changes;
        if !changes.any() {
            return;
        }
        if changes.nodes {
            self.config.invalidate_all().await;
            return;
        }
        if changes.channels {
            self.config.invalidate_channels().await;
        }
        if changes.trigger_routers {
            self.config.invalidate_trigger_routers().await;
        }
    }

    /// Returns whether the reader saw every row in the gaps.
    async fn select_data_and_route(
        &self,
        context: &mut ChannelRouterContext,
        gaps: &[DataGap],
    ) -> Result<bool> {
        context.produce_common_batches = self.produce_common_batches(context.channel_id()).await?;

        let channel = &context.channel.channel;
        let settings = ReaderSettings::new(
            channel.channel_id.clone(),
            channel.max_data_to_route,
            channel.is_nontransactional(),
            &self.params,
        );
        let mut reader = DataGapRouteReader::start(
            Arc::clone(&self.store),
            gaps.to_vec(),
            settings,
            Arc::clone(&self.greater_query_in_use),
        );
        let routed = self.route_from_reader(&mut reader, context).await;
        let summary = reader.finish().await;
        routed?;
        self.complete_batches_and_commit(context).await?;
        Ok(summary.all_data_read)
    }

    async fn route_from_reader(
        &self,
        reader: &mut DataGapRouteReader,
        context: &mut ChannelRouterContext,
    ) -> Result<()> {
        let algorithm = BatchAlgorithm::for_channel(&context.channel.channel);
        let mut next = reader.take().await?;
        while let Some(data) = next.take() {
            next = reader.take().await?;
            let at_transaction_boundary = match &next {
                Some(following) => {
                    following.transaction_id.is_none()
                        || following.transaction_id != data.transaction_id
                }
                None => true,
            };
            self.route_row(context, &data, algorithm, at_transaction_boundary)
                .await?;
            if context.needs_commit {
                self.complete_batches_and_commit(context).await?;
            }
        }
        Ok(())
    }

    /// Close every open batch and commit. Updates happen inside the routing
    /// transaction, so batches and their data events commit together.
    async fn complete_batches_and_commit(&self, context: &mut ChannelRouterContext) -> Result<()> {
        let router_millis = context.elapsed_millis();
        let batches: Vec<OutgoingBatch> = context.batches_by_node.drain().map(|(_, b)| b).collect();
        for mut batch in batches {
            batch.router_millis = router_millis;
            let next = if batch.is_unrouted() {
                OutgoingBatchStatus::Ok
            } else {
                OutgoingBatchStatus::New
            };
            batch.transition(next)?;
            context
                .transaction()
                .await?
                .update_outgoing_batch(&batch)
                .await?;
            context.stats.batch_count += 1;
        }
        context.commit().await
    }

    async fn route_row(
        &self,
        context: &mut ChannelRouterContext,
        data: &Data,
        algorithm: BatchAlgorithm,
        at_transaction_boundary: bool,
    ) -> Result<()> {
        let history = self.config.trigger_history(data.trigger_hist_id).await?;
        let trigger_routers = match &history {
            Some(history) => {
                self.config
                    .trigger_routers_for_trigger(&history.trigger_id)
                    .await?
            }
            None => Vec::new(),
        };

        let history = match history {
            Some(history) if !trigger_routers.is_empty() => history,
            _ => {
                tracing::warn!(
                    "Could not find trigger routers for trigger history id of {}.  Not processing data with the data id of {}",
                    data.trigger_hist_id,
                    data.data_id
                );
                self.insert_unrouted(context, data, UNKNOWN_ROUTER_ID, algorithm, at_transaction_boundary)
                    .await?;
                context.record_routed(data.data_id);
                return Ok(());
            }
        };

        let local_node_id = &self.config.identity().node_id;
        let mut data_events_inserted = 0;
        let mut router_id: &str = UNKNOWN_ROUTER_ID;
        for trigger_router in &trigger_routers {
            router_id = &trigger_router.router.router_id;
            if !trigger_router.is_routed(data.event_type) {
                continue;
            }
            let nodes = self.available_nodes(context, trigger_router).await?;
            let router = self.resolve_router(trigger_router);
            let meta = DataMetaData {
                data,
                history: &history,
                trigger_router,
            };
            let mut node_ids = router
                .route_to_nodes(&meta, &nodes, context, self.lookup.as_ref())
                .await?;

            node_ids.remove(local_node_id);
            if !trigger_router.ping_back_enabled {
                if let Some(source_node_id) = &data.source_node_id {
                    node_ids.remove(source_node_id);
                }
            }
            if let Some(targets) = data.target_node_ids() {
                node_ids.retain(|id| targets.contains(&id.as_str()));
            }

            data_events_inserted += self
                .insert_data_events(context, data, router_id, &node_ids, algorithm, at_transaction_boundary)
                .await?;
        }

        if data_events_inserted == 0 {
            self.insert_unrouted(context, data, router_id, algorithm, at_transaction_boundary)
                .await?;
        }
        context.record_routed(data.data_id);
        Ok(())
    }

    async fn insert_unrouted(
        &self,
        context: &mut ChannelRouterContext,
        data: &Data,
        router_id: &str,
        algorithm: BatchAlgorithm,
        at_transaction_boundary: bool,
    ) -> Result<()> {
        let unrouted: BTreeSet<String> = [UNROUTED_NODE_ID.to_string()].into_iter().collect();
        context.stats.unrouted_count += 1;
        self.insert_data_events(context, data, router_id, &unrouted, algorithm, at_transaction_boundary)
            .await?;
        Ok(())
    }

    /// Add the row to each node's open batch, opening batches as needed.
    ///
    /// In common batch mode every batch opened for the same row shares one
    /// batch id and the row gets a single data event.
    async fn insert_data_events(
        &self,
        context: &mut ChannelRouterContext,
        data: &Data,
        router_id: &str,
        node_ids: &BTreeSet<String>,
        algorithm: BatchAlgorithm,
        at_transaction_boundary: bool,
    ) -> Result<usize> {
        let max_batch_size = context.channel.channel.max_batch_size;
        let mut batch_id_to_reuse: Option<i64> = None;
        let mut data_event_added = false;

        for node_id in node_ids {
            let common = context.produce_common_batches && node_id != UNROUTED_NODE_ID;
            let batch_id = match context.batches_by_node.get(node_id) {
                Some(batch) => batch.batch_id,
                None => {
                    let mut batch = OutgoingBatch::new(
                        node_id.clone(),
                        context.channel_id().to_string(),
                        OutgoingBatchStatus::Routing,
                    );
                    batch.common_flag = common;
                    if common {
                        if let Some(batch_id) = batch_id_to_reuse {
                            batch.batch_id = batch_id;
                        }
                    }
                    context
                        .transaction()
                        .await?
                        .insert_outgoing_batch(&mut batch)
                        .await?;
                    let batch_id = batch.batch_id;
                    context.batches_by_node.insert(node_id.clone(), batch);
                    batch_id
                }
            };
            if common {
                match batch_id_to_reuse {
                    Some(shared) => debug_assert_eq!(
                        shared, batch_id,
                        "common batch for node {node_id} drifted from the shared batch id"
                    ),
                    None => batch_id_to_reuse = Some(batch_id),
                }
            }

            if !context.produce_common_batches || !data_event_added {
                context
                    .add_data_event(data.data_id, batch_id, router_id)
                    .await?;
                data_event_added = true;
            }

            if let Some(batch) = context.batches_by_node.get_mut(node_id) {
                batch.increment_event_count(data.event_type);
                batch.increment_data_event_count();
                if algorithm.is_batch_complete(batch, max_batch_size, at_transaction_boundary) {
                    context.needs_commit = true;
                }
            }
        }
        Ok(node_ids.len())
    }

    /// Enabled nodes of the router's target group, if this group links to it.
    async fn available_nodes(
        &self,
        context: &mut ChannelRouterContext,
        trigger_router: &TriggerRouter,
    ) -> Result<Arc<Vec<Node>>> {
        let router = &trigger_router.router;
        if let Some(nodes) = context.available_nodes(&router.router_id) {
            return Ok(nodes);
        }
        let source_group = &self.config.identity().node_group_id;
        let link = self
            .config
            .node_group_link(source_group, &router.target_node_group_id)
            .await?;
        let nodes = match link {
            Some(_) => {
                self.config
                    .enabled_nodes_in_group(&router.target_node_group_id)
                    .await?
            }
            None => {
                tracing::error!(
                    "The router {} has no node group link configured from {} to {}",
                    router.router_id,
                    source_group,
                    router.target_node_group_id
                );
                Vec::new()
            }
        };
        Ok(context.cache_available_nodes(&router.router_id, nodes))
    }

    fn resolve_router(&self, trigger_router: &TriggerRouter) -> DataRouter {
        let router_type = &trigger_router.router.router_type;
        DataRouter::resolve(router_type, &self.scripts).unwrap_or_else(|| {
            tracing::warn!(
                "Could not find configured router '{}' for trigger with the id of {}. Defaulting the router",
                router_type,
                trigger_router.trigger.trigger_id
            );
            DataRouter::Default
        })
    }

    /// Whether every batch of a wave on this channel can share one batch id.
    ///
    /// Only channels whose routers all broadcast qualify. A table that is
    /// captured on incoming batches and also routed back to our own group
    /// disqualifies the channel, as do the system channels.
    async fn produce_common_batches(&self, channel_id: &str) -> Result<bool> {
        if [CHANNEL_CONFIG, CHANNEL_RELOAD, CHANNEL_HEARTBEAT].contains(&channel_id) {
            return Ok(false);
        }
        let source_group = &self.config.identity().node_group_id;
        let all = self.config.trigger_routers().await?;

        let mut common = true;
        for trigger_router in all.iter().filter(|tr| {
            tr.enabled
                && tr.trigger.channel_id == channel_id
                && &tr.router.source_node_group_id == source_group
        }) {
            if !matches!(
                DataRouter::resolve(&trigger_router.router.router_type, &self.scripts),
                Some(DataRouter::Default)
            ) {
                common = false;
                break;
            }
            if trigger_router.trigger.sync_on_incoming_batch {
                let table = trigger_router.trigger.fully_qualified_source_table_name();
                let routes_back = all.iter().any(|other| {
                    other.trigger.fully_qualified_source_table_name() == table
                        && other.router.target_node_group_id == trigger_router.router.source_node_group_id
                });
                if routes_back {
                    common = false;
                    break;
                }
            }
        }

        let previous = self
            .common_batch_modes
            .lock()
            .await
            .insert(channel_id.to_string(), common);
        if previous != Some(common) {
            if common {
                tracing::info!("The '{}' channel is in common batch mode", channel_id);
            } else {
                tracing::info!("The '{}' channel is NOT in common batch mode", channel_id);
            }
        }
        Ok(common)
    }
}
