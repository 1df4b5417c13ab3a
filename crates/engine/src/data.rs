//! Writing change rows on behalf of the engine itself.

use anyhow::Result;
use std::sync::Arc;

use sync_core::{Data, DataEventType, Store, SyncError};

use crate::config::ConfigurationService;

pub struct DataService {
    store: Arc<dyn Store>,
    config: Arc<ConfigurationService>,
}

impl DataService {
    pub fn new(store: Arc<dyn Store>, config: Arc<ConfigurationService>) -> Self {
        Self { store, config }
    }

    pub async fn insert_data(&self, data: &Data) -> Result<i64> {
        self.store.insert_data(data).await
    }

    /// Queue an initial load of every table routed to a node.
    ///
    /// One `RELOAD` row is written per trigger router from this node's group
    /// to the target's group, in initial load order, addressed only to the
    /// target node. The router's initial load select travels as the row
    /// payload and becomes the where clause of the extraction query.
    /// Returns the number of rows queued.
    pub async fn insert_reload_events(&self, node_id: &str) -> Result<usize> {
        let node = self
            .config
            .node(node_id)
            .await?
            .ok_or_else(|| SyncError::NodeNotFound(node_id.to_string()))?;

        let mut inserted = 0;
        for trigger_router in self.config.trigger_routers_to_group(&node.node_group_id).await? {
            let trigger = &trigger_router.trigger;
            let Some(history) = self.config.active_trigger_history(&trigger.trigger_id).await? else {
                tracing::warn!(
                    "Not reloading {} for node {}: trigger {} has no active history",
                    trigger.source_table_name,
                    node_id,
                    trigger.trigger_id
                );
                continue;
            };

            let mut data = Data::new(
                history.source_table_name.clone(),
                DataEventType::Reload,
                history.trigger_hist_id,
                trigger.reload_channel_id.clone(),
            )
            .with_node_list(node_id);
            if let Some(select) = &trigger_router.initial_load_select {
                data = data.with_row_data(vec![Some(select.clone())]);
            }
            let data_id = self.store.insert_data(&data).await?;
            tracing::debug!(
                "Queued reload of {} for node {} as data {}",
                history.source_table_name,
                node_id,
                data_id
            );
            inserted += 1;
        }
        tracing::info!("Queued {} table reloads for node {}", inserted, node_id);
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{
        ConfigStore, DataRange, DataStore, MemoryStore, Node, Router, Trigger, TriggerHistory,
        TriggerRouter,
    };

    use crate::params::EngineParameters;

    async fn setup() -> (MemoryStore, DataService) {
        let store = MemoryStore::new();
        store.save_node(&Node::new("001", "store", "s1")).await.unwrap();
        for (trigger_id, table, order) in [("t_order", "orders", 20), ("t_item", "item", 10)] {
            let mut tr = TriggerRouter::new(
                Trigger::new(trigger_id, table, "default"),
                Router::new("corp_2_store", "corp", "store"),
            );
            tr.initial_load_order = order;
            if trigger_id == "t_item" {
                tr.initial_load_select = Some("id > 100".to_string());
            }
            store.save_trigger_router(&tr).await.unwrap();
        }
        store
            .save_trigger_history(&TriggerHistory::new(
                0,
                "t_item",
                "item",
                vec!["id".into()],
                vec!["id".into()],
            ))
            .await
            .unwrap();
        store
            .save_trigger_history(&TriggerHistory::new(
                0,
                "t_order",
                "orders",
                vec!["id".into()],
                vec!["id".into()],
            ))
            .await
            .unwrap();

        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let config = Arc::new(ConfigurationService::new(
            Arc::clone(&shared),
            Node::new("000", "corp", "corp"),
            &EngineParameters::default(),
        ));
        (store, DataService::new(shared, config))
    }

    #[tokio::test]
    async fn test_reload_events_in_initial_load_order() {
        let (store, service) = setup().await;
        assert_eq!(service.insert_reload_events("001").await.unwrap(), 2);

        let rows = store
            .select_data("reload", &DataRange::StartingAt(0), 0, 10)
            .await
            .unwrap();
        let tables: Vec<&str> = rows.iter().map(|d| d.table_name.as_str()).collect();
        assert_eq!(tables, vec!["item", "orders"]);
        assert!(rows.iter().all(|d| d.event_type == DataEventType::Reload));
        assert_eq!(rows[0].node_list.as_deref(), Some("001"));
        assert_eq!(rows[0].row_data, Some(vec![Some("id > 100".to_string())]));
        assert_eq!(rows[1].row_data, None);
    }

    #[tokio::test]
    async fn test_reload_for_unknown_node() {
        let (_, service) = setup().await;
        let err = service.insert_reload_events("404").await.unwrap_err();
        assert!(matches!(SyncError::find(&err), Some(SyncError::NodeNotFound(_))));
    }
}
