//! [`PgStore`]: the runtime tables in PostgreSQL.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, Row};

use sync_core::row::{decode, encode};
use sync_core::{
    Channel, ConfigStore, Data, DataEvent, DataEventType, DataGap, DataGapStore, DataRange,
    DataStore, IncomingBatch, IncomingBatchStore, IncomingError, LockStore, Node,
    NodeChannelControl, NodeGroupLink, OutgoingBatch, OutgoingBatchStatus, OutgoingBatchStore,
    RoutingStore, RoutingTransaction, TriggerHistory, TriggerRouter,
};

use crate::client::{connect, new_postgresql_client};
use crate::schema::create_runtime_tables;

const DATA_COLUMNS: &str = "data_id, table_name, event_type, row_data, pk_data, old_data, \
     trigger_hist_id, channel_id, transaction_id, source_node_id, external_data, node_list, create_time";

/// Persistence for every runtime table.
///
/// Routing passes get a dedicated connection so their transaction stays open
/// while the change reader keeps querying through the shared client.
#[derive(Clone)]
pub struct PgStore {
    client: Arc<Mutex<Client>>,
    connection_string: String,
}

impl PgStore {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let client = new_postgresql_client(connection_string).await?;
        Ok(Self {
            client,
            connection_string: connection_string.to_string(),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        Arc::clone(&self.client)
    }

    pub async fn create_runtime_tables(&self) -> Result<()> {
        let client = self.client.lock().await;
        create_runtime_tables(&client).await
    }

    async fn documents<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let client = self.client.lock().await;
        let rows = client.query(sql, &[]).await?;
        rows.iter().map(document).collect()
    }
}

fn document<T: DeserializeOwned>(row: &Row) -> Result<T> {
    let Json(value) = row.try_get::<_, Json<T>>("doc")?;
    Ok(value)
}

fn outgoing_batch(row: &Row) -> Result<OutgoingBatch> {
    let mut batch: OutgoingBatch = document(row)?;
    batch.batch_id = row.try_get("batch_id")?;
    Ok(batch)
}

fn status_codes(statuses: &[OutgoingBatchStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.code().to_string()).collect()
}

fn data_row(row: &Row) -> Result<Data> {
    let event_code: String = row.try_get("event_type")?;
    let event_type = DataEventType::from_code(&event_code)
        .with_context(|| format!("Unknown event type '{event_code}' in sym_data"))?;
    let values = |column: &str| -> Result<_> {
        let text: Option<String> = row.try_get(column)?;
        Ok(text.map(|t| decode(&t)).transpose()?)
    };
    Ok(Data {
        data_id: row.try_get("data_id")?,
        table_name: row.try_get("table_name")?,
        event_type,
        row_data: values("row_data")?,
        pk_data: values("pk_data")?,
        old_data: values("old_data")?,
        trigger_hist_id: row.try_get("trigger_hist_id")?,
        channel_id: row.try_get("channel_id")?,
        transaction_id: row.try_get("transaction_id")?,
        source_node_id: row.try_get("source_node_id")?,
        external_data: row.try_get("external_data")?,
        node_list: row.try_get("node_list")?,
        create_time: row.try_get("create_time")?,
    })
}

/// Render a range filter on `data_id`. Bounds are integers, so they are inlined.
fn range_condition(range: &DataRange) -> String {
    match range {
        DataRange::Ranges(ranges) if ranges.is_empty() => "FALSE".to_string(),
        DataRange::Ranges(ranges) => {
            let terms: Vec<String> = ranges
                .iter()
                .map(|(start, end)| format!("(data_id BETWEEN {start} AND {end})"))
                .collect();
            format!("({})", terms.join(" OR "))
        }
        DataRange::StartingAt(start) => format!("data_id >= {start}"),
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn nodes(&self) -> Result<Vec<Node>> {
        self.documents("SELECT doc FROM sym_node ORDER BY node_id").await
    }

    async fn save_node(&self, node: &Node) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_node (node_id, doc) VALUES ($1, $2)
                 ON CONFLICT (node_id) DO UPDATE SET doc = EXCLUDED.doc",
                &[&node.node_id, &Json(node)],
            )
            .await?;
        Ok(())
    }

    async fn node_group_links(&self) -> Result<Vec<NodeGroupLink>> {
        self.documents(
            "SELECT doc FROM sym_node_group_link ORDER BY source_node_group_id, target_node_group_id",
        )
        .await
    }

    async fn save_node_group_link(&self, link: &NodeGroupLink) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_node_group_link (source_node_group_id, target_node_group_id, doc)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (source_node_group_id, target_node_group_id) DO UPDATE SET doc = EXCLUDED.doc",
                &[
                    &link.source_node_group_id,
                    &link.target_node_group_id,
                    &Json(link),
                ],
            )
            .await?;
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<Channel>> {
        self.documents("SELECT doc FROM sym_channel ORDER BY channel_id").await
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_channel (channel_id, doc) VALUES ($1, $2)
                 ON CONFLICT (channel_id) DO UPDATE SET doc = EXCLUDED.doc",
                &[&channel.channel_id, &Json(channel)],
            )
            .await?;
        Ok(())
    }

    async fn node_channel_controls(&self, node_id: &str) -> Result<Vec<NodeChannelControl>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT doc FROM sym_node_channel_ctl WHERE node_id = $1 ORDER BY channel_id",
                &[&node_id],
            )
            .await?;
        rows.iter().map(document).collect()
    }

    async fn save_node_channel_control(&self, control: &NodeChannelControl) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_node_channel_ctl (node_id, channel_id, doc) VALUES ($1, $2, $3)
                 ON CONFLICT (node_id, channel_id) DO UPDATE SET doc = EXCLUDED.doc",
                &[&control.node_id, &control.channel_id, &Json(control)],
            )
            .await?;
        Ok(())
    }

    async fn trigger_routers(&self) -> Result<Vec<TriggerRouter>> {
        self.documents("SELECT doc FROM sym_trigger_router ORDER BY trigger_router_id")
            .await
    }

    async fn save_trigger_router(&self, trigger_router: &TriggerRouter) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_trigger_router (trigger_router_id, doc) VALUES ($1, $2)
                 ON CONFLICT (trigger_router_id) DO UPDATE SET doc = EXCLUDED.doc",
                &[&trigger_router.id(), &Json(trigger_router)],
            )
            .await?;
        Ok(())
    }

    async fn trigger_histories(&self) -> Result<Vec<TriggerHistory>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT trigger_hist_id, doc FROM sym_trigger_hist ORDER BY trigger_hist_id",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let mut history: TriggerHistory = document(row)?;
                history.trigger_hist_id = row.try_get("trigger_hist_id")?;
                Ok(history)
            })
            .collect()
    }

    async fn save_trigger_history(&self, history: &TriggerHistory) -> Result<i64> {
        let client = self.client.lock().await;
        if history.trigger_hist_id <= 0 {
            let row = client
                .query_one(
                    "INSERT INTO sym_trigger_hist (doc) VALUES ($1) RETURNING trigger_hist_id",
                    &[&Json(history)],
                )
                .await?;
            return Ok(row.try_get(0)?);
        }
        client
            .execute(
                "INSERT INTO sym_trigger_hist (trigger_hist_id, doc) VALUES ($1, $2)
                 ON CONFLICT (trigger_hist_id) DO UPDATE SET doc = EXCLUDED.doc",
                &[&history.trigger_hist_id, &Json(history)],
            )
            .await?;
        // Keep generated ids above explicitly saved ones.
        client
            .execute(
                "SELECT setval(pg_get_serial_sequence('sym_trigger_hist', 'trigger_hist_id'),
                               (SELECT MAX(trigger_hist_id) FROM sym_trigger_hist))",
                &[],
            )
            .await?;
        Ok(history.trigger_hist_id)
    }
}

#[async_trait]
impl DataStore for PgStore {
    async fn insert_data(&self, data: &Data) -> Result<i64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "INSERT INTO sym_data (table_name, event_type, row_data, pk_data, old_data,
                     trigger_hist_id, channel_id, transaction_id, source_node_id, external_data,
                     node_list, create_time)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 RETURNING data_id",
                &[
                    &data.table_name,
                    &data.event_type.code(),
                    &data.row_data.as_deref().map(encode),
                    &data.pk_data.as_deref().map(encode),
                    &data.old_data.as_deref().map(encode),
                    &data.trigger_hist_id,
                    &data.channel_id,
                    &data.transaction_id,
                    &data.source_node_id,
                    &data.external_data,
                    &data.node_list,
                    &data.create_time,
                ],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn select_data(
        &self,
        channel_id: &str,
        range: &DataRange,
        after_data_id: i64,
        limit: usize,
    ) -> Result<Vec<Data>> {
        let sql = format!(
            "SELECT {DATA_COLUMNS} FROM sym_data
             WHERE channel_id = $1 AND data_id > $2 AND {}
             ORDER BY data_id LIMIT $3",
            range_condition(range)
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.client.lock().await;
        let rows = client
            .query(&sql, &[&channel_id, &after_data_id, &limit])
            .await?;
        rows.iter().map(data_row).collect()
    }

    async fn select_routed_data_ids(&self, start_id: i64, end_id: i64) -> Result<Vec<i64>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT DISTINCT data_id FROM sym_data_event
                 WHERE data_id BETWEEN $1 AND $2 ORDER BY data_id",
                &[&start_id, &end_id],
            )
            .await?;
        rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
    }

    async fn count_data_in_range(&self, start_id: i64, end_id: i64) -> Result<i64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM sym_data WHERE data_id > $1 AND data_id < $2",
                &[&start_id, &end_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn min_data_id(&self) -> Result<Option<i64>> {
        let client = self.client.lock().await;
        let row = client.query_one("SELECT MIN(data_id) FROM sym_data", &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn max_data_id(&self) -> Result<Option<i64>> {
        let client = self.client.lock().await;
        let row = client.query_one("SELECT MAX(data_id) FROM sym_data", &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn max_routed_data_id(&self) -> Result<Option<i64>> {
        let client = self.client.lock().await;
        let row = client
            .query_one("SELECT MAX(data_id) FROM sym_data_event", &[])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn select_data_for_batch(&self, batch_id: i64) -> Result<Vec<Data>> {
        let sql = format!(
            "SELECT {DATA_COLUMNS} FROM sym_data
             WHERE data_id IN (SELECT data_id FROM sym_data_event WHERE batch_id = $1)
             ORDER BY data_id"
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&batch_id]).await?;
        rows.iter().map(data_row).collect()
    }

    async fn select_data_ids_for_batch(&self, batch_id: i64) -> Result<Vec<i64>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT DISTINCT data_id FROM sym_data_event WHERE batch_id = $1 ORDER BY data_id",
                &[&batch_id],
            )
            .await?;
        rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
    }
}

#[async_trait]
impl DataGapStore for PgStore {
    async fn data_gaps(&self) -> Result<Vec<DataGap>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT start_id, end_id, create_time FROM sym_data_gap ORDER BY start_id, end_id",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(DataGap::created_at(
                    row.try_get("start_id")?,
                    row.try_get("end_id")?,
                    row.try_get("create_time")?,
                ))
            })
            .collect()
    }

    async fn replace_data_gaps(&self, deleted: &[DataGap], added: &[DataGap]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        for gap in deleted {
            tx.execute(
                "DELETE FROM sym_data_gap WHERE start_id = $1 AND end_id = $2",
                &[&gap.start_id, &gap.end_id],
            )
            .await?;
        }
        for gap in added {
            tx.execute(
                "INSERT INTO sym_data_gap (start_id, end_id, create_time) VALUES ($1, $2, $3)
                 ON CONFLICT (start_id, end_id) DO NOTHING",
                &[&gap.start_id, &gap.end_id, &gap.create_time],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Routing transaction on its own connection, driven with explicit
/// `BEGIN`/`COMMIT` so it can live in a `Box<dyn RoutingTransaction>`.
struct PgRoutingTransaction {
    client: Client,
}

async fn next_batch_id(client: &Client) -> Result<i64> {
    let row = client
        .query_one("SELECT nextval('sym_outgoing_batch_seq')", &[])
        .await?;
    Ok(row.try_get(0)?)
}

#[async_trait]
impl RoutingTransaction for PgRoutingTransaction {
    async fn insert_outgoing_batch(&mut self, batch: &mut OutgoingBatch) -> Result<()> {
        if batch.batch_id <= 0 {
            batch.batch_id = next_batch_id(&self.client).await?;
        }
        self.client
            .execute(
                "INSERT INTO sym_outgoing_batch (batch_id, node_id, channel_id, status, doc)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &batch.batch_id,
                    &batch.node_id,
                    &batch.channel_id,
                    &batch.status.code(),
                    &Json(&*batch),
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to insert outgoing batch {} for node {}",
                    batch.batch_id, batch.node_id
                )
            })?;
        Ok(())
    }

    async fn update_outgoing_batch(&mut self, batch: &OutgoingBatch) -> Result<()> {
        let mut batch = batch.clone();
        batch.last_update_time = Some(Utc::now());
        self.client
            .execute(
                "UPDATE sym_outgoing_batch SET status = $3, doc = $4
                 WHERE batch_id = $1 AND node_id = $2",
                &[&batch.batch_id, &batch.node_id, &batch.status.code(), &Json(&batch)],
            )
            .await?;
        Ok(())
    }

    async fn insert_data_events(&mut self, events: &[DataEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let data_ids: Vec<i64> = events.iter().map(|e| e.data_id).collect();
        let batch_ids: Vec<i64> = events.iter().map(|e| e.batch_id).collect();
        let router_ids: Vec<&str> = events.iter().map(|e| e.router_id.as_str()).collect();
        let inserted = self
            .client
            .execute(
                "INSERT INTO sym_data_event (data_id, batch_id, router_id)
                 SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[])
                 ON CONFLICT DO NOTHING",
                &[&data_ids, &batch_ids, &router_ids],
            )
            .await?;
        debug!("Inserted {inserted} of {} data events", events.len());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

#[async_trait]
impl RoutingStore for PgStore {
    async fn begin_routing(&self) -> Result<Box<dyn RoutingTransaction>> {
        let client = connect(&self.connection_string).await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgRoutingTransaction { client }))
    }
}

#[async_trait]
impl OutgoingBatchStore for PgStore {
    async fn insert_outgoing_batch(&self, batch: &mut OutgoingBatch) -> Result<()> {
        let client = self.client.lock().await;
        if batch.batch_id <= 0 {
            batch.batch_id = next_batch_id(&client).await?;
        }
        client
            .execute(
                "INSERT INTO sym_outgoing_batch (batch_id, node_id, channel_id, status, doc)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (batch_id, node_id) DO UPDATE
                 SET channel_id = EXCLUDED.channel_id, status = EXCLUDED.status, doc = EXCLUDED.doc",
                &[
                    &batch.batch_id,
                    &batch.node_id,
                    &batch.channel_id,
                    &batch.status.code(),
                    &Json(&*batch),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_outgoing_batch(&self, batch: &OutgoingBatch) -> Result<()> {
        let mut batch = batch.clone();
        batch.last_update_time = Some(Utc::now());
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE sym_outgoing_batch SET status = $3, doc = $4
                 WHERE batch_id = $1 AND node_id = $2",
                &[&batch.batch_id, &batch.node_id, &batch.status.code(), &Json(&batch)],
            )
            .await?;
        if updated == 0 {
            bail!(
                "Cannot update outgoing batch {} for node {}: not found",
                batch.batch_id,
                batch.node_id
            );
        }
        Ok(())
    }

    async fn find_outgoing_batch(
        &self,
        batch_id: i64,
        node_id: &str,
    ) -> Result<Option<OutgoingBatch>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT batch_id, doc FROM sym_outgoing_batch WHERE batch_id = $1 AND node_id = $2",
                &[&batch_id, &node_id],
            )
            .await?;
        row.as_ref().map(outgoing_batch).transpose()
    }

    async fn select_outgoing_batches(
        &self,
        node_id: &str,
        statuses: &[OutgoingBatchStatus],
        limit: usize,
    ) -> Result<Vec<OutgoingBatch>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT batch_id, doc FROM sym_outgoing_batch
                 WHERE node_id = $1 AND status = ANY($2)
                 ORDER BY batch_id LIMIT $3",
                &[&node_id, &status_codes(statuses), &limit],
            )
            .await?;
        rows.iter().map(outgoing_batch).collect()
    }

    async fn select_outgoing_batches_by_status(
        &self,
        statuses: &[OutgoingBatchStatus],
    ) -> Result<Vec<OutgoingBatch>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT batch_id, doc FROM sym_outgoing_batch
                 WHERE status = ANY($1) ORDER BY batch_id, node_id",
                &[&status_codes(statuses)],
            )
            .await?;
        rows.iter().map(outgoing_batch).collect()
    }

    async fn mark_all_as_sent_for_node(&self, node_id: &str) -> Result<u64> {
        let client = self.client.lock().await;
        let changed = client
            .execute(
                "UPDATE sym_outgoing_batch
                 SET status = 'OK',
                     doc = doc || jsonb_build_object('status', 'OK', 'error_flag', false,
                                                     'last_update_time', to_jsonb(NOW()))
                 WHERE node_id = $1 AND status <> 'OK'",
                &[&node_id],
            )
            .await?;
        info!("Marked {changed} outgoing batches for node {node_id} as sent");
        Ok(changed)
    }
}

#[async_trait]
impl IncomingBatchStore for PgStore {
    async fn find_incoming_batch(
        &self,
        batch_id: i64,
        node_id: &str,
    ) -> Result<Option<IncomingBatch>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT doc FROM sym_incoming_batch WHERE batch_id = $1 AND node_id = $2",
                &[&batch_id, &node_id],
            )
            .await?;
        row.as_ref().map(document).transpose()
    }

    async fn insert_incoming_batch(&self, batch: &IncomingBatch) -> Result<bool> {
        let client = self.client.lock().await;
        let inserted = client
            .execute(
                "INSERT INTO sym_incoming_batch (batch_id, node_id, status, doc)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (batch_id, node_id) DO NOTHING",
                &[&batch.batch_id, &batch.node_id, &batch.status.code(), &Json(batch)],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn update_incoming_batch(&self, batch: &IncomingBatch) -> Result<()> {
        let mut batch = batch.clone();
        batch.last_update_time = Some(Utc::now());
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_incoming_batch (batch_id, node_id, status, doc)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (batch_id, node_id) DO UPDATE
                 SET status = EXCLUDED.status, doc = EXCLUDED.doc",
                &[&batch.batch_id, &batch.node_id, &batch.status.code(), &Json(&batch)],
            )
            .await?;
        Ok(())
    }

    async fn insert_incoming_error(&self, error: &IncomingError) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_incoming_error (batch_id, node_id, failed_row_number, doc)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (batch_id, node_id, failed_row_number) DO UPDATE SET doc = EXCLUDED.doc",
                &[
                    &error.batch_id,
                    &error.node_id,
                    &error.failed_row_number,
                    &Json(error),
                ],
            )
            .await?;
        Ok(())
    }

    async fn incoming_errors(&self, batch_id: i64, node_id: &str) -> Result<Vec<IncomingError>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT doc FROM sym_incoming_error
                 WHERE batch_id = $1 AND node_id = $2 ORDER BY failed_row_number",
                &[&batch_id, &node_id],
            )
            .await?;
        rows.iter().map(document).collect()
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn init_lock(&self, action: &str) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO sym_lock (lock_action) VALUES ($1) ON CONFLICT (lock_action) DO NOTHING",
                &[&action],
            )
            .await?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        action: &str,
        server_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        self.init_lock(action).await?;
        let client = self.client.lock().await;
        let acquired = client
            .execute(
                "UPDATE sym_lock SET locking_server_id = $2, lock_time = $3
                 WHERE lock_action = $1
                   AND (locking_server_id IS NULL OR lock_time IS NULL
                        OR lock_time < $4 OR locking_server_id = $2)",
                &[&action, &server_id, &now, &stale_before],
            )
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lock(&self, action: &str, server_id: &str) -> Result<bool> {
        let client = self.client.lock().await;
        let released = client
            .execute(
                "UPDATE sym_lock SET locking_server_id = NULL, lock_time = NULL
                 WHERE lock_action = $1 AND locking_server_id = $2",
                &[&action, &server_id],
            )
            .await?;
        Ok(released == 1)
    }
}
