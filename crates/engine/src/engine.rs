//! One node's replication engine: every service wired to a shared store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use staging::{MemoryStagingArea, StagingArea};
use sync_core::{BatchAck, Node, NodeGroupLinkAction, Store};

use crate::ack::AcknowledgeService;
use crate::cluster::{self, ClusterService};
use crate::config::ConfigurationService;
use crate::data::DataService;
use crate::extract::{DataExtractorService, ExtractOutcome, InitialLoadSource};
use crate::load::DataLoaderService;
use crate::outgoing::OutgoingBatchService;
use crate::params::EngineParameters;
use crate::route::{RouterLookup, RouterService, ScriptedRouter};
use crate::transform::TransformSet;
use crate::transport::{SyncEndpoint, Transport};
use crate::writer::TargetDatabase;

pub struct SyncEngineBuilder {
    store: Arc<dyn Store>,
    identity: Node,
    params: EngineParameters,
    staging: Option<Arc<dyn StagingArea>>,
    database: Option<Arc<dyn TargetDatabase>>,
    initial_load: Option<Arc<dyn InitialLoadSource>>,
    transforms: TransformSet,
    lookup: Option<Arc<dyn RouterLookup>>,
    scripts: Vec<(String, ScriptedRouter)>,
}

impl SyncEngineBuilder {
    pub fn params(mut self, params: EngineParameters) -> Self {
        self.params = params;
        self
    }

    pub fn staging(mut self, staging: Arc<dyn StagingArea>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Database that received batches are applied to.
    pub fn database(mut self, database: Arc<dyn TargetDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn initial_load_source(mut self, source: Arc<dyn InitialLoadSource>) -> Self {
        self.initial_load = Some(source);
        self
    }

    pub fn transforms(mut self, transforms: TransformSet) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn router_lookup(mut self, lookup: Arc<dyn RouterLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn scripted_router(mut self, name: impl Into<String>, router: ScriptedRouter) -> Self {
        self.scripts.push((name.into(), router));
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        let database = self.database.ok_or_else(|| {
            anyhow!("A target database is required to build the engine for node {}", self.identity.node_id)
        })?;
        let staging = self
            .staging
            .unwrap_or_else(|| Arc::new(MemoryStagingArea::new()));
        let params = self.params;
        let store = self.store;
        let transforms = Arc::new(self.transforms);

        let config = Arc::new(ConfigurationService::new(
            Arc::clone(&store),
            self.identity.clone(),
            &params,
        ));
        let cluster = Arc::new(ClusterService::new(Arc::clone(&store), &params));
        let server_id = cluster.server_id().to_string();

        let mut router = RouterService::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&cluster),
            &params,
        );
        if let Some(lookup) = self.lookup {
            router = router.with_lookup(lookup);
        }
        for (name, script) in self.scripts {
            router = router.with_scripted_router(name, script);
        }

        let outgoing = Arc::new(OutgoingBatchService::new(
            Arc::clone(&store),
            Arc::clone(&config),
            server_id.clone(),
            &params,
        ));
        let mut extractor = DataExtractorService::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&outgoing),
            Arc::clone(&staging),
            &params,
        )
        .with_transforms(Arc::clone(&transforms));
        if let Some(source) = self.initial_load {
            extractor = extractor.with_initial_load_source(source);
        }
        let loader = DataLoaderService::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&staging),
            database,
            server_id,
            &params,
        )
        .with_transforms(transforms);
        let acknowledger = AcknowledgeService::new(
            Arc::clone(&store),
            Arc::clone(&outgoing),
            Arc::clone(&staging),
        );
        let data = DataService::new(Arc::clone(&store), Arc::clone(&config));

        Ok(SyncEngine {
            identity: self.identity,
            config,
            cluster,
            router,
            outgoing,
            extractor,
            loader,
            acknowledger,
            data,
            staging,
        })
    }
}

/// Routing, extraction, loading and acknowledgment for one node.
///
/// Each job runs under its cluster lock and returns `None` when another
/// process holds it.
pub struct SyncEngine {
    identity: Node,
    config: Arc<ConfigurationService>,
    cluster: Arc<ClusterService>,
    router: RouterService,
    outgoing: Arc<OutgoingBatchService>,
    extractor: DataExtractorService,
    loader: DataLoaderService,
    acknowledger: AcknowledgeService,
    data: DataService,
    staging: Arc<dyn StagingArea>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder(store: Arc<dyn Store>, identity: Node) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            identity,
            params: EngineParameters::default(),
            staging: None,
            database: None,
            initial_load: None,
            transforms: TransformSet::default(),
            lookup: None,
            scripts: Vec::new(),
        }
    }

    pub fn identity(&self) -> &Node {
        &self.identity
    }

    pub fn config(&self) -> &Arc<ConfigurationService> {
        &self.config
    }

    pub fn outgoing(&self) -> &Arc<OutgoingBatchService> {
        &self.outgoing
    }

    pub fn server_id(&self) -> &str {
        self.cluster.server_id()
    }

    /// Prepare lock rows. Call once before running jobs.
    pub async fn start(&self) -> Result<()> {
        self.cluster.init().await?;
        tracing::info!(
            "Started node {} in group {} as server {}",
            self.identity.node_id,
            self.identity.node_group_id,
            self.server_id()
        );
        Ok(())
    }

    /// Run one routing pass. Returns the number of data events created.
    pub async fn route(&self) -> Result<Option<usize>> {
        self.router.route_data().await
    }

    /// Push waiting batches to `remote` and apply the acknowledgments it returns.
    pub async fn push(&self, remote: &Node, transport: &dyn Transport) -> Result<Option<ExtractOutcome>> {
        let result = self
            .cluster
            .with_lock(cluster::PUSH, async {
                let outcome = self.extractor.extract(remote, transport).await?;
                if let Some(url) = &outcome.redirect {
                    self.save_sync_url(&remote.node_id, url).await?;
                }
                self.acknowledger.ack(&outcome.acks).await?;
                Ok(outcome)
            })
            .await?;
        if result.is_none() {
            tracing::info!("Did not run the push process because it is locked by another server");
        }
        Ok(result)
    }

    /// Push to every node this node's group pushes to. A failing node is
    /// logged and the others are still served.
    pub async fn push_to_all(&self, transport: &dyn Transport) -> Result<usize> {
        let mut pushed = 0;
        for node in self.linked_nodes(NodeGroupLinkAction::Push).await? {
            match self.push(&node, transport).await {
                Ok(Some(outcome)) => pushed += outcome.batches.len(),
                Ok(None) => break,
                Err(e) => tracing::warn!("Push to node {} failed: {:#}", node.node_id, e),
            }
        }
        Ok(pushed)
    }

    /// Pull from `remote`, load what it had waiting, and acknowledge it.
    pub async fn pull(&self, remote: &Node, transport: &dyn Transport) -> Result<Option<Vec<BatchAck>>> {
        let result = self
            .cluster
            .with_lock(cluster::PULL, self.loader.load_data_from_pull(remote, transport))
            .await?;
        if result.is_none() {
            tracing::info!("Did not run the pull process because it is locked by another server");
        }
        Ok(result)
    }

    /// Pull from every node whose group waits for this node's group to pull.
    pub async fn pull_from_all(&self, transport: &dyn Transport) -> Result<usize> {
        let mut loaded = 0;
        for node in self.pull_sources().await? {
            match self.pull(&node, transport).await {
                Ok(Some(acks)) => loaded += acks.len(),
                Ok(None) => break,
                Err(e) => tracing::warn!("Pull from node {} failed: {:#}", node.node_id, e),
            }
        }
        Ok(loaded)
    }

    /// Apply a payload pushed to this node.
    pub async fn load(&self, source_node_id: &str, payload: &[u8]) -> Result<Vec<BatchAck>> {
        self.loader.load_data_from_push(source_node_id, payload).await
    }

    /// Send acknowledgments for loaded batches back to their origin.
    pub async fn send_acks(&self, remote: &Node, transport: &dyn Transport, acks: &[BatchAck]) -> Result<bool> {
        self.loader.send_ack(remote, transport, acks).await
    }

    /// Apply acknowledgments received from target nodes.
    pub async fn ack(&self, acks: &[BatchAck]) -> Result<usize> {
        self.acknowledger.ack(acks).await
    }

    /// Build the payload a remote node pulls from this node.
    pub async fn extract_for(&self, node_id: &str) -> Result<Vec<u8>> {
        self.extractor.extract_for_pull(node_id).await
    }

    /// Close stranded outgoing batches and drop staged payloads that were acknowledged.
    pub async fn purge(&self) -> Result<Option<(usize, usize)>> {
        self.cluster
            .with_lock(cluster::PURGE_OUTGOING, async {
                let stranded = self.outgoing.purge_stranded_batches().await?;
                let staged = self.staging.purge_done().await?;
                if stranded > 0 || staged > 0 {
                    tracing::info!(
                        "Purged {} stranded batches and {} staged payloads",
                        stranded,
                        staged
                    );
                }
                Ok((stranded, staged))
            })
            .await
    }

    /// Queue an initial load of every routed table for a node.
    pub async fn reload(&self, node_id: &str) -> Result<usize> {
        self.data.insert_reload_events(node_id).await
    }

    /// Unfinished outgoing batches per status code.
    pub async fn status(&self) -> Result<BTreeMap<String, usize>> {
        self.outgoing.status_counts().await
    }

    /// Enabled nodes in the groups this node's group sends to with `action`.
    pub async fn linked_nodes(&self, action: NodeGroupLinkAction) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for link in self.config.node_group_links().await?.iter() {
            if link.source_node_group_id == self.identity.node_group_id && link.data_event_action == action {
                nodes.extend(self.config.enabled_nodes_in_group(&link.target_node_group_id).await?);
            }
        }
        nodes.retain(|n| n.node_id != self.identity.node_id);
        Ok(nodes)
    }

    /// Enabled nodes that wait for this node to pull their batches.
    pub async fn pull_sources(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for link in self.config.node_group_links().await?.iter() {
            if link.target_node_group_id == self.identity.node_group_id
                && link.data_event_action == NodeGroupLinkAction::WaitForPull
            {
                nodes.extend(self.config.enabled_nodes_in_group(&link.source_node_group_id).await?);
            }
        }
        nodes.retain(|n| n.node_id != self.identity.node_id);
        Ok(nodes)
    }

    async fn save_sync_url(&self, node_id: &str, url: &str) -> Result<()> {
        if let Some(mut node) = self.config.node(node_id).await? {
            node.sync_url = Some(url.to_string());
            self.config.save_node(&node).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncEndpoint for SyncEngine {
    async fn handle_pull(&self, node_id: &str) -> Result<Vec<u8>> {
        self.extract_for(node_id).await
    }

    async fn handle_push(&self, node_id: &str, payload: &[u8]) -> Result<Vec<BatchAck>> {
        self.load(node_id, payload).await
    }

    async fn handle_acks(&self, acks: &[BatchAck]) -> Result<()> {
        self.ack(acks).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{ConfigStore, MemoryStore, NodeGroupLink};

    use crate::writer::MemoryDatabase;

    async fn engine() -> (MemoryStore, SyncEngine) {
        let store = MemoryStore::new();
        store.save_node(&Node::new("000", "corp", "corp")).await.unwrap();
        store.save_node(&Node::new("001", "store", "s1")).await.unwrap();
        store.save_node(&Node::new("101", "region", "r1")).await.unwrap();
        for (source, target, action) in [
            ("corp", "store", NodeGroupLinkAction::Push),
            ("region", "corp", NodeGroupLinkAction::WaitForPull),
        ] {
            store
                .save_node_group_link(&NodeGroupLink {
                    source_node_group_id: source.to_string(),
                    target_node_group_id: target.to_string(),
                    data_event_action: action,
                })
                .await
                .unwrap();
        }
        let engine = SyncEngine::builder(Arc::new(store.clone()), Node::new("000", "corp", "corp"))
            .database(Arc::new(MemoryDatabase::new()))
            .build()
            .unwrap();
        (store, engine)
    }

    #[tokio::test]
    async fn test_link_targets() {
        let (_, engine) = engine().await;
        engine.start().await.unwrap();
        let push: Vec<String> = engine
            .linked_nodes(NodeGroupLinkAction::Push)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(push, vec!["001"]);
        let pull: Vec<String> = engine
            .pull_sources()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(pull, vec!["101"]);
    }

    #[test]
    fn test_build_requires_database() {
        let result = SyncEngine::builder(Arc::new(MemoryStore::new()), Node::new("000", "corp", "corp")).build();
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_idle_jobs() {
        let (_, engine) = engine().await;
        assert_eq!(engine.purge().await.unwrap(), Some((0, 0)));
        assert!(engine.status().await.unwrap().is_empty());
        assert!(engine.handle_pull("001").await.unwrap().is_empty());
    }
}
