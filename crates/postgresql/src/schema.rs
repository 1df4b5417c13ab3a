//! Runtime tables used by [`PgStore`](crate::PgStore).
//!
//! Configuration rows and batch records keep their identifying columns as
//! real columns and the rest of the record as a JSONB document. The change
//! log is fully columnar because capture triggers write to it directly.

use anyhow::{Context, Result};
use log::info;
use tokio_postgres::Client;

/// Session setting that turns capture off while a batch is being loaded.
pub const SYNC_DISABLED_SETTING: &str = "symmetric.sync_disabled";

/// Session setting naming the node a loaded batch came from.
pub const SOURCE_NODE_SETTING: &str = "symmetric.source_node_id";

const RUNTIME_TABLES: &[(&str, &str)] = &[
    (
        "sym_node",
        "CREATE TABLE IF NOT EXISTS sym_node (
            node_id TEXT PRIMARY KEY,
            doc JSONB NOT NULL
        )",
    ),
    (
        "sym_node_group_link",
        "CREATE TABLE IF NOT EXISTS sym_node_group_link (
            source_node_group_id TEXT NOT NULL,
            target_node_group_id TEXT NOT NULL,
            doc JSONB NOT NULL,
            PRIMARY KEY (source_node_group_id, target_node_group_id)
        )",
    ),
    (
        "sym_channel",
        "CREATE TABLE IF NOT EXISTS sym_channel (
            channel_id TEXT PRIMARY KEY,
            doc JSONB NOT NULL
        )",
    ),
    (
        "sym_node_channel_ctl",
        "CREATE TABLE IF NOT EXISTS sym_node_channel_ctl (
            node_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            doc JSONB NOT NULL,
            PRIMARY KEY (node_id, channel_id)
        )",
    ),
    (
        "sym_trigger_router",
        "CREATE TABLE IF NOT EXISTS sym_trigger_router (
            trigger_router_id TEXT PRIMARY KEY,
            doc JSONB NOT NULL
        )",
    ),
    (
        "sym_trigger_hist",
        "CREATE TABLE IF NOT EXISTS sym_trigger_hist (
            trigger_hist_id BIGSERIAL PRIMARY KEY,
            doc JSONB NOT NULL
        )",
    ),
    (
        "sym_data",
        "CREATE TABLE IF NOT EXISTS sym_data (
            data_id BIGSERIAL PRIMARY KEY,
            table_name TEXT NOT NULL,
            event_type TEXT NOT NULL,
            row_data TEXT,
            pk_data TEXT,
            old_data TEXT,
            trigger_hist_id BIGINT NOT NULL,
            channel_id TEXT NOT NULL,
            transaction_id TEXT,
            source_node_id TEXT,
            external_data TEXT,
            node_list TEXT,
            create_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    ),
    (
        "sym_data_event",
        "CREATE TABLE IF NOT EXISTS sym_data_event (
            data_id BIGINT NOT NULL,
            batch_id BIGINT NOT NULL,
            router_id TEXT NOT NULL,
            PRIMARY KEY (batch_id, data_id, router_id)
        )",
    ),
    (
        "sym_data_gap",
        "CREATE TABLE IF NOT EXISTS sym_data_gap (
            start_id BIGINT NOT NULL,
            end_id BIGINT NOT NULL,
            create_time TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (start_id, end_id)
        )",
    ),
    (
        "sym_outgoing_batch",
        "CREATE TABLE IF NOT EXISTS sym_outgoing_batch (
            batch_id BIGINT NOT NULL,
            node_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            status TEXT NOT NULL,
            doc JSONB NOT NULL,
            PRIMARY KEY (batch_id, node_id)
        )",
    ),
    (
        "sym_incoming_batch",
        "CREATE TABLE IF NOT EXISTS sym_incoming_batch (
            batch_id BIGINT NOT NULL,
            node_id TEXT NOT NULL,
            status TEXT NOT NULL,
            doc JSONB NOT NULL,
            PRIMARY KEY (batch_id, node_id)
        )",
    ),
    (
        "sym_incoming_error",
        "CREATE TABLE IF NOT EXISTS sym_incoming_error (
            batch_id BIGINT NOT NULL,
            node_id TEXT NOT NULL,
            failed_row_number BIGINT NOT NULL,
            doc JSONB NOT NULL,
            PRIMARY KEY (batch_id, node_id, failed_row_number)
        )",
    ),
    (
        "sym_lock",
        "CREATE TABLE IF NOT EXISTS sym_lock (
            lock_action TEXT PRIMARY KEY,
            locking_server_id TEXT,
            lock_time TIMESTAMPTZ
        )",
    ),
];

const RUNTIME_OBJECTS: &[&str] = &[
    "CREATE SEQUENCE IF NOT EXISTS sym_outgoing_batch_seq",
    "CREATE INDEX IF NOT EXISTS sym_data_channel_idx ON sym_data (channel_id, data_id)",
    "CREATE INDEX IF NOT EXISTS sym_data_event_data_idx ON sym_data_event (data_id)",
    "CREATE INDEX IF NOT EXISTS sym_outgoing_batch_status_idx ON sym_outgoing_batch (node_id, status)",
];

/// Names of every runtime table, in creation order.
pub fn runtime_table_names() -> impl Iterator<Item = &'static str> {
    RUNTIME_TABLES.iter().map(|(name, _)| *name)
}

/// Create the runtime tables, sequence and indexes if they do not exist.
pub async fn create_runtime_tables(client: &Client) -> Result<()> {
    for (name, ddl) in RUNTIME_TABLES {
        client
            .simple_query(ddl)
            .await
            .with_context(|| format!("Failed to create runtime table {name}"))?;
    }
    for ddl in RUNTIME_OBJECTS {
        client
            .simple_query(ddl)
            .await
            .with_context(|| format!("Failed to run '{ddl}'"))?;
    }
    info!("Created {} runtime tables", RUNTIME_TABLES.len());
    Ok(())
}

/// Drop every runtime table. Used by tests to start from a clean schema.
pub async fn drop_runtime_tables(client: &Client) -> Result<()> {
    for name in runtime_table_names().collect::<Vec<_>>().into_iter().rev() {
        client
            .simple_query(&format!("DROP TABLE IF EXISTS {name} CASCADE"))
            .await?;
    }
    client
        .simple_query("DROP SEQUENCE IF EXISTS sym_outgoing_batch_seq")
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_is_created_idempotently() {
        for (name, ddl) in RUNTIME_TABLES {
            assert!(name.starts_with("sym_"));
            assert!(ddl.starts_with(&format!("CREATE TABLE IF NOT EXISTS {name} (")));
        }
        assert_eq!(runtime_table_names().count(), RUNTIME_TABLES.len());
        assert!(runtime_table_names().any(|n| n == "sym_lock"));
    }
}
