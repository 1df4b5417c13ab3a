//! Wiring a node: store, target database, staging and transport.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use staging::FilesystemStagingArea;
use symmetric_sync_engine::{DirectoryTransport, SyncEngine, SyncEngineBuilder, TargetDatabase, TransformSet};
use symmetric_sync_postgresql::{new_postgresql_client, PgDatabase, PgInitialLoadSource, PgRouterLookup, PgStore};
use sync_core::{ConfigStore, Node, Store, SyncError};

use crate::config::AppConfig;

/// Connection and file locations shared by every command.
#[derive(Parser, Clone, Debug)]
pub struct NodeOpts {
    /// PostgreSQL connection string for the runtime tables and the replicated tables
    #[arg(long, env = "SYMMETRIC_DATABASE_URL")]
    pub database_url: String,

    /// Id of the node this process runs as
    #[arg(long, env = "SYMMETRIC_NODE_ID")]
    pub node_id: String,

    /// Engine parameters and job schedule (TOML)
    #[arg(long, env = "SYMMETRIC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Column transforms (YAML)
    #[arg(long, env = "SYMMETRIC_TRANSFORMS", value_name = "PATH")]
    pub transforms: Option<PathBuf>,

    /// Directory for staged batch payloads
    #[arg(long, env = "SYMMETRIC_STAGING_DIR", default_value = ".symmetric-staging")]
    pub staging_dir: PathBuf,

    /// Shared directory payloads and acks are exchanged through
    #[arg(long, env = "SYMMETRIC_TRANSPORT_DIR", default_value = ".symmetric-transport")]
    pub transport_dir: PathBuf,
}

/// A node ready to run commands.
pub struct NodeRuntime {
    pub engine: Arc<SyncEngine>,
    pub transport: Arc<DirectoryTransport>,
    pub config: AppConfig,
}

/// Find this node in the configured topology.
pub async fn find_identity(store: &dyn ConfigStore, node_id: &str) -> Result<Node> {
    store
        .nodes()
        .await?
        .into_iter()
        .find(|n| n.node_id == node_id)
        .ok_or_else(|| SyncError::NodeNotFound(node_id.to_string()).into())
}

pub fn load_transforms(path: Option<&Path>) -> Result<TransformSet> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read transforms file {}", path.display()))?;
            TransformSet::from_yaml(&content)
                .with_context(|| format!("Failed to parse transforms file {}", path.display()))
        }
        None => Ok(TransformSet::default()),
    }
}

/// Engine builder over any store with filesystem staging. The CLI adds the
/// PostgreSQL lookups; tests build over in-memory stores.
pub fn engine_builder(
    store: Arc<dyn Store>,
    identity: Node,
    config: &AppConfig,
    database: Arc<dyn TargetDatabase>,
    staging_dir: &Path,
    transforms: TransformSet,
) -> SyncEngineBuilder {
    SyncEngine::builder(store, identity)
        .params(config.engine.clone())
        .staging(Arc::new(FilesystemStagingArea::new(staging_dir)))
        .database(database)
        .transforms(transforms)
}

impl NodeRuntime {
    pub async fn connect(opts: &NodeOpts) -> Result<Self> {
        let config = AppConfig::load(opts.config.as_deref())?;
        let store = PgStore::connect(&opts.database_url)
            .await
            .context("Failed to connect to the runtime database")?;
        let identity = find_identity(&store, &opts.node_id).await?;

        // Loads hold their client for a whole batch, so the target and the
        // source-side lookups get connections of their own.
        let database = PgDatabase::connect(&opts.database_url).await?;
        let source = new_postgresql_client(&opts.database_url).await?;

        let engine = engine_builder(
            Arc::new(store),
            identity,
            &config,
            Arc::new(database),
            &opts.staging_dir,
            load_transforms(opts.transforms.as_deref())?,
        )
        .initial_load_source(Arc::new(PgInitialLoadSource::new(Arc::clone(&source))))
        .router_lookup(Arc::new(PgRouterLookup::new(source)))
        .build()?;

        let transport = DirectoryTransport::new(&opts.transport_dir, &opts.node_id);
        Ok(Self {
            engine: Arc::new(engine),
            transport: Arc::new(transport),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_transforms() {
        assert!(load_transforms(None).unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transforms.yaml");
        std::fs::write(
            &path,
            "- point: load\n  table: item\n  rules:\n    - lowercase: { column: name }\n",
        )
        .unwrap();
        assert!(!load_transforms(Some(&path)).unwrap().is_empty());

        let err = load_transforms(Some(&dir.path().join("missing.yaml"))).unwrap_err();
        assert!(format!("{err:#}").contains("missing.yaml"));
    }

    #[test]
    fn test_node_opts_from_args() {
        let opts = NodeOpts::try_parse_from([
            "node",
            "--database-url",
            "postgresql://localhost/sync",
            "--node-id",
            "store-001",
        ])
        .unwrap();
        assert_eq!(opts.node_id, "store-001");
        assert_eq!(opts.staging_dir, PathBuf::from(".symmetric-staging"));
        assert!(opts.config.is_none());
    }
}
