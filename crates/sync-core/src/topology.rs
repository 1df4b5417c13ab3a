//! Topology definitions loaded from YAML.
//!
//! A topology file lists the nodes, node group links, channels and
//! trigger-router bindings a deployment starts with. It is seeded into a
//! [`ConfigStore`] by `symmetric-sync init`.
//!
//! ```yaml
//! nodes:
//!   - node_id: corp-000
//!     node_group_id: corp
//!     external_id: "000"
//! node_group_links:
//!   - source_node_group_id: corp
//!     target_node_group_id: store
//!     data_event_action: P
//! channels:
//!   - channel_id: default
//! trigger_routers:
//!   - trigger: { trigger_id: item, source_table_name: item }
//!     router: { router_id: corp_2_store, source_node_group_id: corp, target_node_group_id: store }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::{
    Channel, Node, NodeChannelControl, NodeGroupLink, TriggerHistory, TriggerRouter,
    CHANNEL_CONFIG, CHANNEL_DEFAULT, CHANNEL_HEARTBEAT, CHANNEL_RELOAD,
};
use crate::store::ConfigStore;

/// Errors that can occur while loading a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Failed to read topology file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Trigger router '{trigger_router}' references unknown channel '{channel}'")]
    UnknownChannel {
        trigger_router: String,
        channel: String,
    },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node group link {source_group} -> {target_group} names a group with no nodes")]
    UnknownNodeGroup {
        source_group: String,
        target_group: String,
    },
}

/// Initial configuration of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub node_group_links: Vec<NodeGroupLink>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub node_channels: Vec<NodeChannelControl>,
    #[serde(default)]
    pub trigger_routers: Vec<TriggerRouter>,
    #[serde(default)]
    pub trigger_histories: Vec<TriggerHistory>,
}

impl Topology {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TopologyError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a topology and add the built-in channels it does not declare.
    pub fn from_yaml(yaml: &str) -> Result<Self, TopologyError> {
        let mut topology: Topology = serde_yaml::from_str(yaml)?;
        topology.add_builtin_channels();
        topology.validate()?;
        Ok(topology)
    }

    fn add_builtin_channels(&mut self) {
        let builtins = [
            (CHANNEL_CONFIG, 0),
            (CHANNEL_RELOAD, 1),
            (CHANNEL_HEARTBEAT, 2),
            (CHANNEL_DEFAULT, 99_999),
        ];
        for (channel_id, order) in builtins {
            if !self.channels.iter().any(|c| c.channel_id == channel_id) {
                let mut channel = Channel::new(channel_id, order);
                if channel_id == CHANNEL_RELOAD {
                    channel.reload_flag = true;
                }
                self.channels.push(channel);
            }
        }
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(TopologyError::DuplicateNode(node.node_id.clone()));
            }
        }

        if !self.nodes.is_empty() {
            let groups: HashSet<&str> = self
                .nodes
                .iter()
                .map(|n| n.node_group_id.as_str())
                .collect();
            for link in &self.node_group_links {
                if !groups.contains(link.source_node_group_id.as_str())
                    && !groups.contains(link.target_node_group_id.as_str())
                {
                    return Err(TopologyError::UnknownNodeGroup {
                        source_group: link.source_node_group_id.clone(),
                        target_group: link.target_node_group_id.clone(),
                    });
                }
            }
        }

        for tr in &self.trigger_routers {
            let channel = &tr.trigger.channel_id;
            if !self.channels.iter().any(|c| &c.channel_id == channel) {
                return Err(TopologyError::UnknownChannel {
                    trigger_router: tr.id(),
                    channel: channel.clone(),
                });
            }
        }
        Ok(())
    }

    /// Write every entity into the configuration store.
    pub async fn seed(&self, store: &dyn ConfigStore) -> anyhow::Result<()> {
        for node in &self.nodes {
            store.save_node(node).await?;
        }
        for link in &self.node_group_links {
            store.save_node_group_link(link).await?;
        }
        for channel in &self.channels {
            store.save_channel(channel).await?;
        }
        for control in &self.node_channels {
            store.save_node_channel_control(control).await?;
        }
        for tr in &self.trigger_routers {
            store.save_trigger_router(tr).await?;
        }
        for history in &self.trigger_histories {
            store.save_trigger_history(history).await?;
        }
        tracing::info!(
            "Seeded topology: {} nodes, {} links, {} channels, {} trigger routers",
            self.nodes.len(),
            self.node_group_links.len(),
            self.channels.len(),
            self.trigger_routers.len()
        );
        Ok(())
    }
}
