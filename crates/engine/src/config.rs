//! Cached access to nodes, channels and routing configuration.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sync_core::{
    Channel, Node, NodeChannel, NodeChannelControl, NodeGroupLink, Store, TriggerHistory,
    TriggerRouter,
};

use crate::cache::TtlCache;
use crate::params::EngineParameters;

/// Configuration reads for the engine, served from TTL caches.
///
/// Every write goes through this service and invalidates the affected
/// caches before returning.
pub struct ConfigurationService {
    store: Arc<dyn Store>,
    identity: Node,
    channels: TtlCache<(), Vec<Channel>>,
    node_channels: TtlCache<String, Vec<NodeChannel>>,
    nodes: TtlCache<(), Vec<Node>>,
    links: TtlCache<(), Vec<NodeGroupLink>>,
    trigger_routers: TtlCache<(), Vec<TriggerRouter>>,
    histories: TtlCache<(), HashMap<i64, TriggerHistory>>,
}

impl ConfigurationService {
    pub fn new(store: Arc<dyn Store>, identity: Node, params: &EngineParameters) -> Self {
        let channel_ttl = Duration::from_millis(params.cache_timeout_channel_ms);
        let node_ttl = Duration::from_millis(params.cache_timeout_node_ms);
        let router_ttl = Duration::from_millis(params.cache_timeout_trigger_router_ms);
        Self {
            store,
            identity,
            channels: TtlCache::new(channel_ttl),
            node_channels: TtlCache::new(channel_ttl),
            nodes: TtlCache::new(node_ttl),
            links: TtlCache::new(node_ttl),
            trigger_routers: TtlCache::new(router_ttl),
            histories: TtlCache::new(router_ttl),
        }
    }

    /// The node this engine runs as.
    pub fn identity(&self) -> &Node {
        &self.identity
    }

    pub async fn channels(&self) -> Result<Arc<Vec<Channel>>> {
        let store = Arc::clone(&self.store);
        self.channels
            .get_or_load(&(), || async move { store.channels().await })
            .await
    }

    pub async fn channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self
            .channels()
            .await?
            .iter()
            .find(|c| c.channel_id == channel_id)
            .cloned())
    }

    /// Channels with a node's controls applied, in processing order.
    pub async fn node_channels(&self, node_id: &str) -> Result<Arc<Vec<NodeChannel>>> {
        let channels = self.channels().await?;
        let store = Arc::clone(&self.store);
        let owner = node_id.to_string();
        self.node_channels
            .get_or_load(&owner.clone(), || async move {
                let controls = store.node_channel_controls(&owner).await?;
                let mut node_channels: Vec<NodeChannel> = channels
                    .iter()
                    .map(|channel| {
                        let mut nc = NodeChannel::new(owner.clone(), channel.clone());
                        if let Some(control) =
                            controls.iter().find(|c| c.channel_id == channel.channel_id)
                        {
                            nc.apply_control(control);
                        }
                        nc
                    })
                    .collect();
                node_channels.sort_by(|a, b| {
                    a.channel
                        .processing_order
                        .cmp(&b.channel.processing_order)
                        .then_with(|| a.channel_id().cmp(b.channel_id()))
                });
                Ok(node_channels)
            })
            .await
    }

    pub async fn node_channel(&self, node_id: &str, channel_id: &str) -> Result<Option<NodeChannel>> {
        Ok(self
            .node_channels(node_id)
            .await?
            .iter()
            .find(|nc| nc.channel_id() == channel_id)
            .cloned())
    }

    pub async fn save_channel(&self, channel: &Channel) -> Result<()> {
        self.store.save_channel(channel).await?;
        self.invalidate_channels().await;
        Ok(())
    }

    pub async fn save_node_channel_control(&self, control: &NodeChannelControl) -> Result<()> {
        self.store.save_node_channel_control(control).await?;
        self.node_channels.invalidate(&control.node_id).await;
        Ok(())
    }

    pub async fn invalidate_channels(&self) {
        self.channels.invalidate_all().await;
        self.node_channels.invalidate_all().await;
    }

    pub async fn nodes(&self) -> Result<Arc<Vec<Node>>> {
        let store = Arc::clone(&self.store);
        self.nodes
            .get_or_load(&(), || async move { store.nodes().await })
            .await
    }

    pub async fn node(&self, node_id: &str) -> Result<Option<Node>> {
        Ok(self
            .nodes()
            .await?
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned())
    }

    pub async fn enabled_nodes_in_group(&self, node_group_id: &str) -> Result<Vec<Node>> {
        Ok(self
            .nodes()
            .await?
            .iter()
            .filter(|n| n.node_group_id == node_group_id && n.sync_enabled)
            .cloned()
            .collect())
    }

    pub async fn save_node(&self, node: &Node) -> Result<()> {
        self.store.save_node(node).await?;
        self.nodes.invalidate_all().await;
        Ok(())
    }

    pub async fn node_group_links(&self) -> Result<Arc<Vec<NodeGroupLink>>> {
        let store = Arc::clone(&self.store);
        self.links
            .get_or_load(&(), || async move { store.node_group_links().await })
            .await
    }

    pub async fn node_group_link(
        &self,
        source_node_group_id: &str,
        target_node_group_id: &str,
    ) -> Result<Option<NodeGroupLink>> {
        Ok(self
            .node_group_links()
            .await?
            .iter()
            .find(|l| {
                l.source_node_group_id == source_node_group_id
                    && l.target_node_group_id == target_node_group_id
            })
            .cloned())
    }

    pub async fn save_node_group_link(&self, link: &NodeGroupLink) -> Result<()> {
        self.store.save_node_group_link(link).await?;
        self.links.invalidate_all().await;
        Ok(())
    }

    pub async fn trigger_routers(&self) -> Result<Arc<Vec<TriggerRouter>>> {
        let store = Arc::clone(&self.store);
        self.trigger_routers
            .get_or_load(&(), || async move { store.trigger_routers().await })
            .await
    }

    /// Enabled trigger routers of a trigger whose router starts at this node's group.
    pub async fn trigger_routers_for_trigger(&self, trigger_id: &str) -> Result<Vec<TriggerRouter>> {
        Ok(self
            .trigger_routers()
            .await?
            .iter()
            .filter(|tr| {
                tr.enabled
                    && tr.trigger.trigger_id == trigger_id
                    && tr.router.source_node_group_id == self.identity.node_group_id
            })
            .cloned()
            .collect())
    }

    /// Enabled trigger routers from this node's group to `target_node_group_id`, in initial load order.
    pub async fn trigger_routers_to_group(&self, target_node_group_id: &str) -> Result<Vec<TriggerRouter>> {
        let mut routers: Vec<TriggerRouter> = self
            .trigger_routers()
            .await?
            .iter()
            .filter(|tr| {
                tr.enabled
                    && tr.router.source_node_group_id == self.identity.node_group_id
                    && tr.router.target_node_group_id == target_node_group_id
            })
            .cloned()
            .collect();
        routers.sort_by_key(|tr| tr.initial_load_order);
        Ok(routers)
    }

    pub async fn save_trigger_router(&self, trigger_router: &TriggerRouter) -> Result<()> {
        self.store.save_trigger_router(trigger_router).await?;
        self.invalidate_trigger_routers().await;
        Ok(())
    }

    pub async fn invalidate_trigger_routers(&self) {
        self.trigger_routers.invalidate_all().await;
    }

    /// Look up a trigger history, reloading once on a miss since histories are added at runtime.
    pub async fn trigger_history(&self, trigger_hist_id: i64) -> Result<Option<TriggerHistory>> {
        if let Some(history) = self.load_histories().await?.get(&trigger_hist_id) {
            return Ok(Some(history.clone()));
        }
        self.histories.invalidate_all().await;
        Ok(self.load_histories().await?.get(&trigger_hist_id).cloned())
    }

    /// The active history of a trigger, if one exists.
    pub async fn active_trigger_history(&self, trigger_id: &str) -> Result<Option<TriggerHistory>> {
        Ok(self
            .load_histories()
            .await?
            .values()
            .filter(|h| h.trigger_id == trigger_id && h.is_active())
            .max_by_key(|h| h.trigger_hist_id)
            .cloned())
    }

    pub async fn save_trigger_history(&self, history: &TriggerHistory) -> Result<i64> {
        let id = self.store.save_trigger_history(history).await?;
        self.histories.invalidate_all().await;
        Ok(id)
    }

    async fn load_histories(&self) -> Result<Arc<HashMap<i64, TriggerHistory>>> {
        let store = Arc::clone(&self.store);
        self.histories
            .get_or_load(&(), || async move {
                Ok(store
                    .trigger_histories()
                    .await?
                    .into_iter()
                    .map(|h| (h.trigger_hist_id, h))
                    .collect())
            })
            .await
    }

    pub async fn invalidate_all(&self) {
        self.invalidate_channels().await;
        self.nodes.invalidate_all().await;
        self.links.invalidate_all().await;
        self.invalidate_trigger_routers().await;
        self.histories.invalidate_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{ConfigStore, MemoryStore, Router, Trigger};

    async fn service() -> (MemoryStore, ConfigurationService) {
        let store = MemoryStore::new();
        store.save_channel(&Channel::new("default", 10)).await.unwrap();
        store.save_channel(&Channel::new("config", 0)).await.unwrap();
        store.save_channel(&Channel::new("audit", 10)).await.unwrap();
        let service = ConfigurationService::new(
            Arc::new(store.clone()),
            Node::new("corp-000", "corp", "000"),
            &EngineParameters::default(),
        );
        (store, service)
    }

    #[tokio::test]
    async fn test_node_channels_sorted_with_controls() {
        let (_store, service) = service().await;
        let mut control = NodeChannelControl::new("corp-000", "default");
        control.suspend_enabled = true;
        service.save_node_channel_control(&control).await.unwrap();

        let ids: Vec<String> = service
            .node_channels("corp-000")
            .await
            .unwrap()
            .iter()
            .map(|nc| nc.channel_id().to_string())
            .collect();
        assert_eq!(ids, vec!["config", "audit", "default"]);

        let default = service.node_channel("corp-000", "default").await.unwrap().unwrap();
        assert!(default.suspend_enabled);
        let other = service.node_channel("store-001", "default").await.unwrap().unwrap();
        assert!(!other.suspend_enabled);
    }

    #[tokio::test]
    async fn test_writes_through_service_invalidate() {
        let (store, service) = service().await;
        assert_eq!(service.channels().await.unwrap().len(), 3);

        // a write behind the service's back stays invisible until the TTL lapses
        store.save_channel(&Channel::new("sideways", 5)).await.unwrap();
        assert_eq!(service.channels().await.unwrap().len(), 3);

        service.save_channel(&Channel::new("reload", 1)).await.unwrap();
        assert_eq!(service.channels().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_trigger_routers_filtered_by_source_group() {
        let (_store, service) = service().await;
        let item = Trigger::new("item", "item", "default");
        service
            .save_trigger_router(&TriggerRouter::new(
                item.clone(),
                Router::new("corp_2_store", "corp", "store"),
            ))
            .await
            .unwrap();
        service
            .save_trigger_router(&TriggerRouter::new(
                item,
                Router::new("store_2_corp", "store", "corp"),
            ))
            .await
            .unwrap();

        let routers = service.trigger_routers_for_trigger("item").await.unwrap();
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].router.router_id, "corp_2_store");
        assert_eq!(service.trigger_routers_to_group("store").await.unwrap().len(), 1);
        assert!(service.trigger_routers_to_group("corp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_history_reloads_on_miss() {
        let (store, service) = service().await;
        assert!(service.trigger_history(1).await.unwrap().is_none());

        let hist = TriggerHistory::new(0, "item", "item", vec!["id".into()], vec!["id".into()]);
        let id = store.save_trigger_history(&hist).await.unwrap();
        assert_eq!(
            service.trigger_history(id).await.unwrap().unwrap().trigger_id,
            "item"
        );
        assert!(service.active_trigger_history("item").await.unwrap().is_some());
    }
}
