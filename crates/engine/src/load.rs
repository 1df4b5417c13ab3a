//! Loading received payloads into the local database.
//!
//! A payload may hold several batches. Each batch is applied in its own
//! transaction and yields one [`BatchAck`]. A failing batch is rolled back
//! and recorded, and the batches after it are still applied. A batch whose
//! incoming row is already `OK` is not applied again but is still
//! acknowledged as loaded, which makes redelivery harmless.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use staging::{ResourceState, StagedResourceId, StagingArea};
use symmetric_sync_protocol::{BatchHeader, CsvData, ProtocolEvent, ProtocolReader, TableHeader};
use sync_core::{
    BatchAck, IncomingBatch, IncomingBatchStatus, IncomingError, Node, Store, SyncError,
};

use crate::config::ConfigurationService;
use crate::params::EngineParameters;
use crate::transform::{TablePlan, TransformPoint, TransformSet};
use crate::transport::{Transport, TransportResponse};
use crate::writer::{ConflictSettings, DatabaseWriter, TargetDatabase};

/// A batch between its header and its commit line.
struct BatchLoad {
    batch: IncomingBatch,
    writer: Option<DatabaseWriter>,
    plan: Option<TablePlan>,
    table: Option<TableHeader>,
    row_number: i64,
    started_at_byte: u64,
    failed: bool,
}

impl BatchLoad {
    fn applying(&self) -> bool {
        self.writer.is_some()
    }
}

pub struct DataLoaderService {
    store: Arc<dyn Store>,
    config: Arc<ConfigurationService>,
    staging: Arc<dyn StagingArea>,
    database: Arc<dyn TargetDatabase>,
    transforms: Arc<TransformSet>,
    conflict: ConflictSettings,
    server_id: String,
    stream_to_file: bool,
    ack_retries: u32,
    ack_retry_delay: Duration,
}

impl DataLoaderService {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigurationService>,
        staging: Arc<dyn StagingArea>,
        database: Arc<dyn TargetDatabase>,
        server_id: impl Into<String>,
        params: &EngineParameters,
    ) -> Self {
        Self {
            store,
            config,
            staging,
            database,
            transforms: Arc::new(TransformSet::default()),
            conflict: params.conflict,
            server_id: server_id.into(),
            stream_to_file: params.stream_to_file_enabled,
            ack_retries: params.num_of_ack_retries,
            ack_retry_delay: params.time_between_ack_retries(),
        }
    }

    pub fn with_transforms(mut self, transforms: Arc<TransformSet>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Apply a payload pushed by `source_node_id`.
    pub async fn load_data_from_push(
        &self,
        source_node_id: &str,
        payload: &[u8],
    ) -> Result<Vec<BatchAck>> {
        self.load_payload(source_node_id, payload, 0).await
    }

    /// Pull waiting batches from `remote`, apply them, and send the
    /// acknowledgments back.
    pub async fn load_data_from_pull(
        &self,
        remote: &Node,
        transport: &dyn Transport,
    ) -> Result<Vec<BatchAck>> {
        let started = Instant::now();
        let payload = match transport.open_pull(remote).await? {
            TransportResponse::Ok(payload) => payload,
            TransportResponse::Redirect(url) => {
                self.save_redirect(remote, &url).await?;
                return Ok(Vec::new());
            }
        };
        if payload.is_empty() {
            tracing::debug!("No batches waiting at node {}", remote.node_id);
            return Ok(Vec::new());
        }
        let network_millis = started.elapsed().as_millis() as i64;

        let acks = self
            .load_payload(&remote.node_id, &payload, network_millis)
            .await?;
        if !acks.is_empty() {
            self.send_ack(remote, transport, &acks).await?;
        }
        Ok(acks)
    }

    /// Send acknowledgments, retrying failed attempts.
    ///
    /// Returns false when every attempt failed. The origin then sends the
    /// batches again and they are acknowledged without being re-applied.
    pub async fn send_ack(
        &self,
        remote: &Node,
        transport: &dyn Transport,
        acks: &[BatchAck],
    ) -> Result<bool> {
        let tries = self.ack_retries.max(1);
        for attempt in 1..=tries {
            match transport.send_acks(remote, acks).await {
                Ok(TransportResponse::Ok(())) => return Ok(true),
                Ok(TransportResponse::Redirect(url)) => {
                    self.save_redirect(remote, &url).await?;
                    tracing::warn!(
                        "Ack was not sent successfully on try number {} of {}: redirected to {}",
                        attempt,
                        tries,
                        url
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Ack was not sent successfully on try number {} of {}: {:#}",
                        attempt,
                        tries,
                        e
                    );
                }
            }
            if attempt < tries && !self.ack_retry_delay.is_zero() {
                tokio::time::sleep(self.ack_retry_delay).await;
            }
        }
        tracing::error!(
            "Gave up sending {} acknowledgments to node {}",
            acks.len(),
            remote.node_id
        );
        Ok(false)
    }

    async fn save_redirect(&self, remote: &Node, url: &str) -> Result<()> {
        tracing::info!("Node {} redirected this node to {}", remote.node_id, url);
        if let Some(mut node) = self.config.node(&remote.node_id).await? {
            node.sync_url = Some(url.to_string());
            self.config.save_node(&node).await?;
        }
        Ok(())
    }

    async fn load_payload(
        &self,
        source_node_id: &str,
        payload: &[u8],
        network_millis: i64,
    ) -> Result<Vec<BatchAck>> {
        if !self.stream_to_file {
            return self.apply(source_node_id, payload, network_millis).await;
        }
        let Some(first_batch_id) = first_batch_id(payload) else {
            return self.apply(source_node_id, payload, network_millis).await;
        };

        // The whole payload is staged before anything is applied, so an
        // interrupted load can be repeated from the staged copy.
        let id = StagedResourceId::incoming(source_node_id, first_batch_id);
        self.staging.write(&id, payload).await?;
        let staged = self
            .staging
            .read(&id)
            .await?
            .ok_or_else(|| anyhow!("Staged payload {} disappeared before it was loaded", id))?;
        let acks = self.apply(source_node_id, &staged, network_millis).await?;
        self.staging.set_state(&id, ResourceState::Done).await?;
        Ok(acks)
    }

    async fn apply(
        &self,
        source_node_id: &str,
        payload: &[u8],
        network_millis: i64,
    ) -> Result<Vec<BatchAck>> {
        let local_node_id = self.config.identity().node_id.clone();
        let mut reader = ProtocolReader::new(payload);
        let mut acks = Vec::new();
        let mut current: Option<BatchLoad> = None;

        loop {
            let event = match reader.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    let Some(mut load) = current.take() else {
                        return Err(e.into());
                    };
                    tracing::error!(
                        "Stopped reading the payload from node {} in batch {}: {}",
                        source_node_id,
                        load.batch.batch_id,
                        e
                    );
                    self.fail(&mut load, e.into(), None).await;
                    acks.push(self.finish(load, &reader, &local_node_id).await);
                    return Ok(acks);
                }
            };

            match event {
                ProtocolEvent::Batch(header) => {
                    if let Some(mut unfinished) = current.take() {
                        let error = SyncError::Protocol {
                            line: reader.line_number(),
                            message: format!(
                                "Batch {} started before batch {} was committed",
                                header.batch_id, unfinished.batch.batch_id
                            ),
                        };
                        self.fail(&mut unfinished, error.into(), None).await;
                        acks.push(self.finish(unfinished, &reader, &local_node_id).await);
                    }
                    let mut load = self
                        .begin_batch(source_node_id, &header, reader.bytes_read())
                        .await?;
                    load.batch.network_millis = network_millis;
                    current = Some(load);
                }
                ProtocolEvent::Table(table) => {
                    if let Some(load) = current.as_mut() {
                        self.start_table(load, table);
                    }
                }
                ProtocolEvent::Data(data) => {
                    if let Some(load) = current.as_mut() {
                        self.write_row(load, &data).await;
                    }
                }
                ProtocolEvent::Commit(batch_id) => match current.take() {
                    Some(load) if load.batch.batch_id == batch_id => {
                        acks.push(self.finish(load, &reader, &local_node_id).await);
                    }
                    other => {
                        tracing::warn!(
                            "Commit of batch {} does not match the open batch from node {}",
                            batch_id,
                            source_node_id
                        );
                        current = other;
                    }
                },
            }
        }
        Ok(acks)
    }

    /// Find or create the incoming row that guards a batch against a
    /// concurrent or repeated load.
    async fn begin_batch(
        &self,
        source_node_id: &str,
        header: &BatchHeader,
        bytes_read: u64,
    ) -> Result<BatchLoad> {
        let node_id = if header.source_node_id.is_empty() {
            source_node_id
        } else {
            header.source_node_id.as_str()
        };

        let mut batch = IncomingBatch::new(header.batch_id, node_id, header.channel_id.clone());
        batch.last_update_hostname = Some(self.server_id.clone());
        if !self.store.insert_incoming_batch(&batch).await? {
            let existing = self
                .store
                .find_incoming_batch(header.batch_id, node_id)
                .await?
                .ok_or_else(|| {
                    anyhow!(
                        "Incoming batch {}-{} could neither be inserted nor found",
                        node_id,
                        header.batch_id
                    )
                })?;
            batch = existing;
            if batch.status.is_applied() {
                tracing::info!(
                    "Skipping batch {}-{} because it was already loaded",
                    node_id,
                    header.batch_id
                );
                batch.skipped = true;
            } else {
                tracing::info!(
                    "Retrying batch {}-{} which was in status {}",
                    node_id,
                    header.batch_id,
                    batch.status
                );
                batch.retry = true;
                batch.reset_stats();
                batch.status = IncomingBatchStatus::Loading;
                batch.last_update_hostname = Some(self.server_id.clone());
                self.store.update_incoming_batch(&batch).await?;
            }
        }

        let mut load = BatchLoad {
            batch,
            writer: None,
            plan: None,
            table: None,
            row_number: 0,
            started_at_byte: bytes_read,
            failed: false,
        };
        if load.batch.skipped {
            return Ok(load);
        }
        if header.ignored {
            load.batch.status = IncomingBatchStatus::Ignored;
            return Ok(load);
        }
        match DatabaseWriter::open(self.database.as_ref(), self.conflict, node_id).await {
            Ok(writer) => load.writer = Some(writer),
            Err(e) => self.fail(&mut load, e, None).await,
        }
        Ok(load)
    }

    fn start_table(&self, load: &mut BatchLoad, table: TableHeader) {
        let Some(writer) = load.writer.as_mut() else {
            return;
        };
        load.plan = self.transforms.plan(TransformPoint::Load, &table);
        let target = load.plan.as_ref().map_or(table, |p| p.header().clone());
        writer.start_table(target.clone());
        load.table = Some(target);
    }

    async fn write_row(&self, load: &mut BatchLoad, data: &CsvData) {
        if load.batch.status == IncomingBatchStatus::Ignored {
            load.batch.ignore_count += 1;
            return;
        }
        if !load.applying() {
            return;
        }
        load.row_number += 1;
        let transformed = load.plan.as_ref().map(|p| p.apply(data));
        let record = transformed.as_ref().unwrap_or(data);
        let result = match load.writer.as_mut() {
            Some(writer) => writer.write(record).await,
            None => return,
        };
        if let Err(e) = result {
            self.fail(load, e, Some(data)).await;
        }
    }

    /// Record a failure on the batch and roll back its transaction. Rows up
    /// to the commit line are then read but not applied.
    async fn fail(&self, load: &mut BatchLoad, error: anyhow::Error, data: Option<&CsvData>) {
        if load.failed {
            return;
        }
        load.failed = true;
        if let Some(writer) = load.writer.take() {
            let stats = writer.statistics();
            load.batch.database_millis = stats.database_millis;
            writer.rollback().await;
        }

        let batch = &mut load.batch;
        tracing::error!(
            "Failed to load batch {}-{}: {:#}",
            batch.node_id,
            batch.batch_id,
            error
        );
        batch.set_sql_error(&SyncError::sql_error_of(&error));
        batch.error_flag = true;
        if !batch.skipped {
            batch.status = IncomingBatchStatus::Error;
        }

        let Some(data) = data else {
            return;
        };
        batch.failed_row_number = load.row_number;
        batch.failed_line_number = data.line_number;
        let incoming_error = IncomingError {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
            failed_row_number: load.row_number,
            failed_line_number: data.line_number,
            target_table_name: load
                .table
                .as_ref()
                .map(|t| t.fully_qualified_name())
                .unwrap_or_default(),
            event_type: data.event_type,
            row_data: data.row_data.clone(),
            pk_data: data.pk_data.clone(),
            old_data: data.old_data.clone(),
            create_time: Utc::now(),
        };
        if let Err(e) = self.store.insert_incoming_error(&incoming_error).await {
            tracing::warn!(
                "Failed to record the failing row of batch {}-{}: {:#}",
                batch.node_id,
                batch.batch_id,
                e
            );
        }
    }

    /// Commit a batch and build its acknowledgment.
    async fn finish<R: std::io::BufRead>(
        &self,
        mut load: BatchLoad,
        reader: &ProtocolReader<R>,
        local_node_id: &str,
    ) -> BatchAck {
        load.batch.byte_count = reader.bytes_read().saturating_sub(load.started_at_byte) as i64;

        if let Some(writer) = load.writer.take() {
            match writer.commit().await {
                Ok(stats) => {
                    let batch = &mut load.batch;
                    batch.statement_count = stats.statement_count;
                    batch.fallback_insert_count = stats.fallback_insert_count;
                    batch.fallback_update_count = stats.fallback_update_count;
                    batch.missing_delete_count = stats.missing_delete_count;
                    batch.ignore_count = stats.ignore_count;
                    batch.database_millis = stats.database_millis;
                    batch.status = IncomingBatchStatus::Ok;
                }
                Err(e) => {
                    load.failed = false;
                    self.fail(&mut load, e, None).await;
                }
            }
        }

        let batch = &mut load.batch;
        if !batch.skipped {
            batch.last_update_hostname = Some(self.server_id.clone());
            if let Err(e) = self.store.update_incoming_batch(batch).await {
                tracing::error!(
                    "Failed to save incoming batch {}-{}: {:#}",
                    batch.node_id,
                    batch.batch_id,
                    e
                );
            }
        }
        match batch.status {
            IncomingBatchStatus::Error => tracing::warn!(
                "Batch {}-{} failed at row {}",
                batch.node_id,
                batch.batch_id,
                batch.failed_row_number
            ),
            status => tracing::debug!(
                "Batch {}-{} finished as {} with {} statements",
                batch.node_id,
                batch.batch_id,
                status,
                batch.statement_count
            ),
        }
        BatchAck::from_incoming(batch, local_node_id)
    }
}

fn first_batch_id(payload: &[u8]) -> Option<i64> {
    ProtocolReader::new(payload)
        .find_map(|event| match event {
            Ok(ProtocolEvent::Batch(header)) => Some(Some(header.batch_id)),
            Ok(_) => None,
            Err(_) => Some(None),
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use staging::MemoryStagingArea;
    use symmetric_sync_protocol::ProtocolWriter;
    use sync_core::{AckStatus, ConfigStore, IncomingBatchStore, MemoryStore, RowValues, CONFLICT_STATE};

    use crate::transport::{LoopbackNetwork, SimulatedFault, SyncEndpoint};
    use crate::writer::{MemoryDatabase, MissingDeletePolicy};

    struct Fixture {
        store: MemoryStore,
        database: MemoryDatabase,
        staging: MemoryStagingArea,
        service: DataLoaderService,
    }

    fn fixture_with(params: EngineParameters) -> Fixture {
        let store = MemoryStore::new();
        let database = MemoryDatabase::new();
        let staging = MemoryStagingArea::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let config = Arc::new(ConfigurationService::new(
            Arc::clone(&shared),
            Node::new("001", "store", "s1"),
            &params,
        ));
        let service = DataLoaderService::new(
            shared,
            config,
            Arc::new(staging.clone()),
            Arc::new(database.clone()),
            "server-b",
            &params,
        );
        Fixture {
            store,
            database,
            staging,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineParameters::default())
    }

    fn stop_on_missing_delete() -> EngineParameters {
        let mut params = EngineParameters::default();
        params.conflict.missing_delete = MissingDeletePolicy::Stop;
        params
    }

    fn item(id: &str, name: &str) -> RowValues {
        vec![Some(id.to_string()), Some(name.to_string())]
    }

    fn item_table() -> TableHeader {
        TableHeader::new("item", vec!["id".into(), "name".into()], vec!["id".into()])
    }

    fn payload(batches: &[(i64, Vec<CsvData>)]) -> Vec<u8> {
        let mut writer = ProtocolWriter::new(Vec::new());
        for (batch_id, rows) in batches {
            writer
                .start_batch(&BatchHeader::new(*batch_id, "000", "default"))
                .unwrap();
            writer.write_table(&item_table()).unwrap();
            for row in rows {
                writer.write_data(row).unwrap();
            }
            writer.end_batch(*batch_id).unwrap();
        }
        writer.into_inner()
    }

    async fn incoming(store: &MemoryStore, batch_id: i64) -> IncomingBatch {
        store.find_incoming_batch(batch_id, "000").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_load_applies_batch_and_acks() {
        let f = fixture();
        let bytes = payload(&[(
            10,
            vec![
                CsvData::insert(item("1", "apple")),
                CsvData::insert(item("2", "pear")),
                CsvData::update(item("2", "fig"), vec![Some("2".into())], None),
            ],
        )]);

        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        assert_eq!(acks, vec![BatchAck {
            byte_count: acks[0].byte_count,
            database_millis: acks[0].database_millis,
            ..BatchAck::ok(10, "001")
        }]);

        let rows = f.database.rows("item").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("name"), Some(&Some("fig".to_string())));
        assert_eq!(f.database.trigger_toggles().await, 1);

        let batch = incoming(&f.store, 10).await;
        assert_eq!(batch.status, IncomingBatchStatus::Ok);
        assert_eq!(batch.statement_count, 3);
        assert!(batch.byte_count > 0);
        assert_eq!(batch.last_update_hostname.as_deref(), Some("server-b"));

        let staged = f
            .staging
            .find(&StagedResourceId::incoming("000", 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(staged.state, ResourceState::Done);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_not_applied_twice() {
        let f = fixture();
        let bytes = payload(&[(10, vec![CsvData::insert(item("1", "apple"))])]);
        f.service.load_data_from_push("000", &bytes).await.unwrap();

        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].is_ok());
        assert_eq!(f.database.trigger_toggles().await, 1);
        assert_eq!(incoming(&f.store, 10).await.statement_count, 1);
    }

    #[tokio::test]
    async fn test_missing_delete_is_ignored_by_default() {
        let f = fixture();
        let bytes = payload(&[(10, vec![CsvData::delete(vec![Some("9".into())], None)])]);
        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        assert!(acks[0].is_ok());
        let batch = incoming(&f.store, 10).await;
        assert_eq!(batch.missing_delete_count, 1);
        assert!(f.store.incoming_errors(10, "000").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_delete_with_stop_policy_fails_the_batch() {
        let f = fixture_with(stop_on_missing_delete());
        let bytes = payload(&[(
            10,
            vec![
                CsvData::insert(item("1", "apple")),
                CsvData::delete(vec![Some("9".into())], None),
            ],
        )]);

        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        assert_eq!(acks[0].status, AckStatus::Error);
        assert_eq!(acks[0].error_line, 2);
        assert_eq!(acks[0].sql_state.as_deref(), Some(CONFLICT_STATE));

        let batch = incoming(&f.store, 10).await;
        assert_eq!(batch.status, IncomingBatchStatus::Error);
        assert_eq!(batch.failed_row_number, 2);
        assert!(batch.error_flag);
        assert_eq!(f.database.row_count("item").await, 0);

        let errors = f.store.incoming_errors(10, "000").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].target_table_name, "item");
        assert_eq!(errors[0].pk_data, Some(vec![Some("9".to_string())]));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_block_later_batches() {
        let f = fixture_with(stop_on_missing_delete());
        let bytes = payload(&[
            (10, vec![CsvData::delete(vec![Some("5".into())], None)]),
            (11, vec![CsvData::insert(item("5", "plum"))]),
        ]);
        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        let statuses: Vec<AckStatus> = acks.iter().map(|a| a.status).collect();
        assert_eq!(statuses, vec![AckStatus::Error, AckStatus::Ok]);

        // Now that row 5 exists the failed batch applies on redelivery.
        let retry = payload(&[(10, vec![CsvData::delete(vec![Some("5".into())], None)])]);
        let acks = f.service.load_data_from_push("000", &retry).await.unwrap();
        assert!(acks[0].is_ok());
        let batch = incoming(&f.store, 10).await;
        assert_eq!(batch.status, IncomingBatchStatus::Ok);
        assert_eq!(batch.failed_row_number, 0);
        assert_eq!(f.database.row_count("item").await, 0);
    }

    #[tokio::test]
    async fn test_sql_error_is_recorded() {
        let f = fixture();
        f.database.fail_writes_to("item").await;
        let bytes = payload(&[(10, vec![CsvData::insert(item("1", "apple"))])]);
        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        assert_eq!(acks[0].sql_state.as_deref(), Some("42000"));
        assert_eq!(acks[0].error_line, 1);
        let insert_line = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .position(|l| l.starts_with("insert"))
            .unwrap() as i64
            + 1;
        assert_eq!(incoming(&f.store, 10).await.failed_line_number, insert_line);
    }

    #[tokio::test]
    async fn test_ignored_batch_is_acknowledged_without_loading() {
        let f = fixture();
        let mut writer = ProtocolWriter::new(Vec::new());
        let mut header = BatchHeader::new(12, "000", "default");
        header.ignored = true;
        writer.start_batch(&header).unwrap();
        writer.end_batch(12).unwrap();

        let acks = f
            .service
            .load_data_from_push("000", &writer.into_inner())
            .await
            .unwrap();
        assert!(acks[0].is_ok());
        assert!(acks[0].ignored);
        assert_eq!(incoming(&f.store, 12).await.status, IncomingBatchStatus::Ignored);
        assert_eq!(f.database.trigger_toggles().await, 0);
    }

    #[tokio::test]
    async fn test_truncated_payload_fails_open_batch() {
        let f = fixture();
        let mut bytes = payload(&[(10, vec![CsvData::insert(item("1", "apple"))])]);
        bytes.truncate(bytes.len() - "commit,10\n".len());

        let acks = f.service.load_data_from_push("000", &bytes).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, AckStatus::Error);
        assert_eq!(f.database.row_count("item").await, 0);

        assert!(f
            .service
            .load_data_from_push("000", b"insert,1\n")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_load_transforms_are_applied() {
        let mut f = fixture();
        let transforms = TransformSet::from_yaml(
            r#"
- point: load
  table: item
  rules:
    - uppercase: { column: name }
"#,
        )
        .unwrap();
        f.service = f.service.with_transforms(Arc::new(transforms));
        let bytes = payload(&[(10, vec![CsvData::insert(item("1", "apple"))])]);
        f.service.load_data_from_push("000", &bytes).await.unwrap();
        let rows = f.database.rows("item").await;
        assert_eq!(rows[0].get("name"), Some(&Some("APPLE".to_string())));
    }

    struct Source {
        payload: Vec<u8>,
        acks: tokio::sync::Mutex<Vec<BatchAck>>,
    }

    #[async_trait::async_trait]
    impl SyncEndpoint for Source {
        async fn handle_pull(&self, _node_id: &str) -> Result<Vec<u8>> {
            Ok(self.payload.clone())
        }

        async fn handle_push(&self, _node_id: &str, _payload: &[u8]) -> Result<Vec<BatchAck>> {
            Ok(Vec::new())
        }

        async fn handle_acks(&self, acks: &[BatchAck]) -> Result<()> {
            self.acks.lock().await.extend_from_slice(acks);
            Ok(())
        }
    }

    fn no_ack_delay() -> EngineParameters {
        EngineParameters {
            num_of_ack_retries: 3,
            time_between_ack_retries_ms: 0,
            ..EngineParameters::default()
        }
    }

    #[tokio::test]
    async fn test_pull_loads_and_acks_with_retries() {
        let f = fixture_with(no_ack_delay());
        let source = Arc::new(Source {
            payload: payload(&[(10, vec![CsvData::insert(item("1", "apple"))])]),
            acks: Default::default(),
        });
        let network = LoopbackNetwork::new();
        network.register("000", source.clone()).await;
        let transport = network.transport("001");
        let remote = Node::new("000", "corp", "corp");

        // The pull goes through; the first two ack attempts fail.
        let acks = f.service.load_data_from_pull(&remote, &transport).await.unwrap();
        assert_eq!(acks.len(), 1);
        network
            .inject_fault("000", SimulatedFault::ConnectionRefused, 2)
            .await;
        assert!(f.service.send_ack(&remote, &transport, &acks).await.unwrap());
        assert_eq!(source.acks.lock().await.len(), 2);

        network.inject_fault("000", SimulatedFault::Busy, 3).await;
        assert!(!f.service.send_ack(&remote, &transport, &acks).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_redirect_updates_node_url() {
        let f = fixture();
        let remote = Node::new("000", "corp", "corp");
        f.store.save_node(&remote).await.unwrap();
        let network = LoopbackNetwork::new();
        network.redirect("000", Some("http://corp-2/sync")).await;

        let acks = f
            .service
            .load_data_from_pull(&remote, &network.transport("001"))
            .await
            .unwrap();
        assert!(acks.is_empty());
        let node = f
            .store
            .nodes()
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.node_id == "000")
            .unwrap();
        assert_eq!(node.sync_url.as_deref(), Some("http://corp-2/sync"));
    }
}
