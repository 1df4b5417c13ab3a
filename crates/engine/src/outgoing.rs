//! Outgoing batch bookkeeping outside of routing.

use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sync_core::{OutgoingBatch, OutgoingBatchStatus, Store};

use crate::config::ConfigurationService;
use crate::params::EngineParameters;

pub struct OutgoingBatchService {
    store: Arc<dyn Store>,
    config: Arc<ConfigurationService>,
    server_id: String,
    max_to_select: usize,
    purge_stranded: bool,
}

impl OutgoingBatchService {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigurationService>,
        server_id: impl Into<String>,
        params: &EngineParameters,
    ) -> Self {
        Self {
            store,
            config,
            server_id: server_id.into(),
            max_to_select: params.outgoing_batches_max_to_select,
            purge_stranded: params.outgoing_batches_purge_stranded,
        }
    }

    /// Batches ready to be sent to a node.
    ///
    /// Channels are visited in processing order. Each contributes at most
    /// `max_batch_to_send` batches in id order, and nothing past its first
    /// batch in error so a failing batch is never overtaken on its channel.
    pub async fn get_outgoing_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let candidates = self
            .store
            .select_outgoing_batches(node_id, OutgoingBatchStatus::extractable(), self.max_to_select)
            .await?;

        let mut by_channel: BTreeMap<&str, Vec<&OutgoingBatch>> = BTreeMap::new();
        for batch in &candidates {
            by_channel.entry(batch.channel_id.as_str()).or_default().push(batch);
        }

        let mut channels: Vec<_> = self
            .config
            .channels()
            .await?
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        channels.sort_by(|a, b| {
            a.processing_order
                .cmp(&b.processing_order)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });

        let mut selected = Vec::new();
        for channel in channels {
            let Some(batches) = by_channel.get_mut(channel.channel_id.as_str()) else {
                continue;
            };
            batches.sort_by_key(|b| b.batch_id);
            for batch in batches.iter().take(channel.max_batch_to_send.max(1)) {
                selected.push((*batch).clone());
                if batch.status == OutgoingBatchStatus::Error {
                    break;
                }
            }
        }
        selected.truncate(self.max_to_select);
        Ok(selected)
    }

    pub async fn find_outgoing_batch(
        &self,
        batch_id: i64,
        node_id: &str,
    ) -> Result<Option<OutgoingBatch>> {
        self.store.find_outgoing_batch(batch_id, node_id).await
    }

    /// Persist a batch, stamping who changed it and when.
    pub async fn update_outgoing_batch(&self, batch: &mut OutgoingBatch) -> Result<()> {
        batch.last_update_hostname = Some(self.server_id.clone());
        batch.last_update_time = Some(Utc::now());
        self.store.update_outgoing_batch(batch).await
    }

    pub async fn mark_all_as_sent_for_node(&self, node_id: &str) -> Result<u64> {
        let changed = self.store.mark_all_as_sent_for_node(node_id).await?;
        if changed > 0 {
            tracing::warn!("Marked {} batches for node {} as OK", changed, node_id);
        }
        Ok(changed)
    }

    pub async fn count_batches_in_error(&self) -> Result<usize> {
        Ok(self
            .store
            .select_outgoing_batches_by_status(&[OutgoingBatchStatus::Error])
            .await?
            .len())
    }

    /// Number of unfinished batches per status code.
    pub async fn status_counts(&self) -> Result<BTreeMap<String, usize>> {
        use OutgoingBatchStatus::*;
        let batches = self
            .store
            .select_outgoing_batches_by_status(&[Routing, New, Querying, Sending, Loading, Error, Ignored])
            .await?;
        let mut counts = BTreeMap::new();
        for batch in batches {
            *counts.entry(batch.status.code().to_string()).or_insert(0) += 1;
        }
        std::result::Result::Ok(counts)
    }

    /// Force unfinished batches of nodes that no longer exist to `OK`.
    ///
    /// Such batches can never be delivered. They are closed rather than
    /// deleted so the routing history stays intact.
    pub async fn purge_stranded_batches(&self) -> Result<usize> {
        if !self.purge_stranded {
            return std::result::Result::Ok(0);
        }
        use OutgoingBatchStatus::*;
        let known: HashSet<String> = self
            .store
            .nodes()
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        let batches = self
            .store
            .select_outgoing_batches_by_status(&[New, Querying, Sending, Loading, Error, Ignored])
            .await?;

        let mut purged = 0;
        for mut batch in batches {
            if batch.is_unrouted() || known.contains(&batch.node_id) {
                continue;
            }
            if let Some(previous) = batch.force_ok() {
                tracing::warn!(
                    "Setting stranded batch {} for missing node {} from {} to OK",
                    batch.batch_id,
                    batch.node_id,
                    previous
                );
                self.update_outgoing_batch(&mut batch).await?;
                purged += 1;
            }
        }
        std::result::Result::Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{Channel, ConfigStore, MemoryStore, Node, OutgoingBatchStore};

    async fn setup(params: EngineParameters) -> (MemoryStore, OutgoingBatchService) {
        let store = MemoryStore::new();
        let mut fast = Channel::new("config", 0);
        fast.max_batch_to_send = 2;
        store.save_channel(&fast).await.unwrap();
        store.save_channel(&Channel::new("default", 10)).await.unwrap();
        store.save_node(&Node::new("001", "store", "s1")).await.unwrap();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let config = Arc::new(ConfigurationService::new(
            Arc::clone(&shared),
            Node::new("000", "corp", "corp"),
            &params,
        ));
        let service = OutgoingBatchService::new(shared, config, "server-a", &params);
        (store, service)
    }

    async fn add(store: &MemoryStore, id: i64, node: &str, channel: &str, status: OutgoingBatchStatus) {
        let mut batch = OutgoingBatch::new(node, channel, status);
        batch.batch_id = id;
        store.insert_outgoing_batch(&mut batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_follow_channel_order_and_limits() {
        let (store, service) = setup(EngineParameters::default()).await;
        use OutgoingBatchStatus::*;
        add(&store, 1, "001", "default", New).await;
        add(&store, 2, "001", "config", New).await;
        add(&store, 3, "001", "config", Sending).await;
        add(&store, 4, "001", "config", New).await;
        add(&store, 5, "001", "default", Ok).await;
        add(&store, 6, "002", "default", New).await;

        let ids: Vec<i64> = service
            .get_outgoing_batches("001")
            .await
            .unwrap()
            .iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_nothing_after_error_on_a_channel() {
        let (store, service) = setup(EngineParameters::default()).await;
        use OutgoingBatchStatus::*;
        add(&store, 1, "001", "default", Error).await;
        add(&store, 2, "001", "default", New).await;
        add(&store, 3, "001", "config", New).await;

        let ids: Vec<i64> = service
            .get_outgoing_batches("001")
            .await
            .unwrap()
            .iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(service.count_batches_in_error().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_to_select_caps_the_result() {
        let params = EngineParameters {
            outgoing_batches_max_to_select: 2,
            ..EngineParameters::default()
        };
        let (store, service) = setup(params).await;
        for id in 1..=4 {
            add(&store, id, "001", "default", OutgoingBatchStatus::New).await;
        }
        assert_eq!(service.get_outgoing_batches("001").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_stranded_batches() {
        let (store, service) = setup(EngineParameters::default()).await;
        add(&store, 1, "001", "default", OutgoingBatchStatus::New).await;
        add(&store, 2, "999", "default", OutgoingBatchStatus::Error).await;

        assert_eq!(service.purge_stranded_batches().await.unwrap(), 1);
        let stranded = store.find_outgoing_batch(2, "999").await.unwrap().unwrap();
        assert_eq!(stranded.status, OutgoingBatchStatus::Ok);
        assert_eq!(stranded.last_update_hostname.as_deref(), Some("server-a"));
        let live = store.find_outgoing_batch(1, "001").await.unwrap().unwrap();
        assert_eq!(live.status, OutgoingBatchStatus::New);
    }

    #[tokio::test]
    async fn test_mark_all_as_sent_and_status_counts() {
        let (store, service) = setup(EngineParameters::default()).await;
        add(&store, 1, "001", "default", OutgoingBatchStatus::New).await;
        add(&store, 2, "001", "default", OutgoingBatchStatus::Error).await;
        add(&store, 3, "002", "default", OutgoingBatchStatus::New).await;

        let counts = service.status_counts().await.unwrap();
        assert_eq!(counts.get("NE"), Some(&2));
        assert_eq!(service.mark_all_as_sent_for_node("001").await.unwrap(), 2);
        let counts = service.status_counts().await.unwrap();
        assert_eq!(counts.get("NE"), Some(&1));
        assert_eq!(counts.get("ER"), None);
    }
}
