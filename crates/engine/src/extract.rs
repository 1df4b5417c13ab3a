//! Extraction: turning routed batches into payloads for a target node.
//!
//! Every batch moves `NE → QY` before its rows are read and `QY → SE` once
//! its payload is complete. After the transport confirms delivery the
//! batch moves to `LD` and waits for the target's acknowledgment. Each
//! change is persisted right away, so a crash leaves every batch in a
//! status the next pass knows how to resume from.
//!
//! With staging enabled a payload is written to the [`StagingArea`] before
//! it is sent, and a batch that has to be sent again reuses the staged
//! bytes instead of querying the change log a second time.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use staging::{ResourceState, StagedResourceId, StagingArea};
use symmetric_sync_protocol::{BatchHeader, CsvData, ProtocolWriter, TableHeader};
use sync_core::{
    BatchAck, Data, DataEventType, Node, NodeChannel, OutgoingBatch, OutgoingBatchStatus, Router,
    RowValues, Store, SyncError, TriggerHistory, CHANNEL_RELOAD,
};

use crate::config::ConfigurationService;
use crate::outgoing::OutgoingBatchService;
use crate::params::EngineParameters;
use crate::transform::{TablePlan, TransformPoint, TransformSet};
use crate::transport::{Transport, TransportResponse};
use crate::writer::MemoryDatabase;

/// Router value that clears a target catalog or schema.
const NONE_VALUE: &str = "NONE";

/// Reads the current contents of a table for an initial load.
#[async_trait]
pub trait InitialLoadSource: Send + Sync {
    /// Rows of the history's table, with values in the history's column order.
    async fn select_rows(
        &self,
        history: &TriggerHistory,
        where_clause: Option<&str>,
    ) -> Result<Vec<RowValues>>;
}

#[async_trait]
impl InitialLoadSource for MemoryDatabase {
    async fn select_rows(
        &self,
        history: &TriggerHistory,
        where_clause: Option<&str>,
    ) -> Result<Vec<RowValues>> {
        if let Some(clause) = where_clause {
            tracing::debug!("The in-memory database ignores the initial load condition '{}'", clause);
        }
        Ok(self
            .rows(&history.fully_qualified_table_name())
            .await
            .into_iter()
            .map(|row| {
                history
                    .column_names
                    .iter()
                    .map(|c| row.get(&c.to_lowercase()).cloned().flatten())
                    .collect()
            })
            .collect())
    }
}

/// Payload built for one node, and the batches it contains.
#[derive(Debug)]
pub struct ExtractedPayload {
    pub payload: Vec<u8>,
    pub batches: Vec<OutgoingBatch>,
    pub extracted_at: Instant,
}

impl ExtractedPayload {
    fn empty() -> Self {
        Self {
            payload: Vec::new(),
            batches: Vec::new(),
            extracted_at: Instant::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Result of pushing to a node.
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub batches: Vec<OutgoingBatch>,
    pub acks: Vec<BatchAck>,
    /// The node asked to be contacted at another URL. Batches stay in `SE`.
    pub redirect: Option<String>,
}

/// Target identity and transform of one trigger history.
struct TableLayout {
    header: TableHeader,
    plan: Option<TablePlan>,
}

pub struct DataExtractorService {
    store: Arc<dyn Store>,
    config: Arc<ConfigurationService>,
    outgoing: Arc<OutgoingBatchService>,
    staging: Arc<dyn StagingArea>,
    initial_load: Option<Arc<dyn InitialLoadSource>>,
    transforms: Arc<TransformSet>,
    max_bytes_to_sync: u64,
    stream_to_file: bool,
    requery_interval: Duration,
}

impl DataExtractorService {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigurationService>,
        outgoing: Arc<OutgoingBatchService>,
        staging: Arc<dyn StagingArea>,
        params: &EngineParameters,
    ) -> Self {
        Self {
            store,
            config,
            outgoing,
            staging,
            initial_load: None,
            transforms: Arc::new(TransformSet::default()),
            max_bytes_to_sync: params.transport_max_bytes_to_sync,
            stream_to_file: params.stream_to_file_enabled,
            requery_interval: params.extract_requery_interval(),
        }
    }

    pub fn with_initial_load_source(mut self, source: Arc<dyn InitialLoadSource>) -> Self {
        self.initial_load = Some(source);
        self
    }

    pub fn with_transforms(mut self, transforms: Arc<TransformSet>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Extract the batches waiting for `remote` and push them over `transport`.
    ///
    /// Returns the acknowledgments the remote sent back; applying them is up
    /// to the caller.
    pub async fn extract(&self, remote: &Node, transport: &dyn Transport) -> Result<ExtractOutcome> {
        let mut extracted = self.extract_payload(&remote.node_id).await?;
        if extracted.is_empty() {
            return Ok(ExtractOutcome::default());
        }

        let started = Instant::now();
        let payload = std::mem::take(&mut extracted.payload);
        let byte_count = payload.len();
        match transport.push(remote, payload).await {
            Ok(TransportResponse::Ok(acks)) => {
                let network_millis = started.elapsed().as_millis() as i64;
                self.mark_transmitted(&mut extracted.batches, extracted.extracted_at, network_millis)
                    .await?;
                tracing::info!(
                    "Pushed {} batches ({} bytes) to node {}",
                    extracted.batches.len(),
                    byte_count,
                    remote.node_id
                );
                Ok(ExtractOutcome {
                    batches: extracted.batches,
                    acks,
                    redirect: None,
                })
            }
            Ok(TransportResponse::Redirect(url)) => {
                tracing::info!("Node {} redirected the push to {}", remote.node_id, url);
                Ok(ExtractOutcome {
                    batches: extracted.batches,
                    acks: Vec::new(),
                    redirect: Some(url),
                })
            }
            Err(e) => {
                for batch in extracted.batches.iter_mut() {
                    if batch.status == OutgoingBatchStatus::Sending {
                        self.record_failure(batch, &e).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Build the payload a node pulls. The returned batches are considered
    /// transmitted once the bytes are handed over.
    pub async fn extract_for_pull(&self, node_id: &str) -> Result<Vec<u8>> {
        let mut extracted = self.extract_payload(node_id).await?;
        self.mark_transmitted(&mut extracted.batches, extracted.extracted_at, 0)
            .await?;
        Ok(extracted.payload)
    }

    /// Extract waiting batches for a node until the byte budget is spent.
    ///
    /// Batches on reload channels go first. A batch that fails is recorded
    /// in `ER` and later batches of its channel are held back, while other
    /// channels carry on.
    pub async fn extract_payload(&self, node_id: &str) -> Result<ExtractedPayload> {
        let batches = self.outgoing.get_outgoing_batches(node_id).await?;
        if batches.is_empty() {
            return Ok(ExtractedPayload::empty());
        }
        let node = self
            .config
            .node(node_id)
            .await?
            .ok_or_else(|| SyncError::NodeNotFound(node_id.to_string()))?;
        let channels: HashMap<String, NodeChannel> = self
            .config
            .node_channels(node_id)
            .await?
            .iter()
            .map(|nc| (nc.channel_id().to_string(), nc.clone()))
            .collect();

        let is_reload = |batch: &OutgoingBatch| {
            batch.channel_id == CHANNEL_RELOAD
                || channels
                    .get(&batch.channel_id)
                    .is_some_and(|nc| nc.channel.reload_flag)
        };
        let (mut ordered, rest): (Vec<_>, Vec<_>) = batches.into_iter().partition(|b| is_reload(b));
        ordered.extend(rest);

        let total = ordered.len();
        let mut extracted = ExtractedPayload::empty();
        let mut failed_channels: HashSet<String> = HashSet::new();
        let mut extracted_channels: HashSet<String> = HashSet::new();

        for (index, mut batch) in ordered.into_iter().enumerate() {
            if failed_channels.contains(&batch.channel_id) {
                continue;
            }
            let Some(node_channel) = channels.get(&batch.channel_id) else {
                tracing::debug!(
                    "Skipping batch {}-{} on unknown channel {}",
                    batch.node_id,
                    batch.batch_id,
                    batch.channel_id
                );
                continue;
            };
            if node_channel.suspend_enabled {
                continue;
            }

            let ignore = node_channel.ignore_enabled
                && matches!(
                    batch.status,
                    OutgoingBatchStatus::New | OutgoingBatchStatus::Ignored
                );
            let result = if ignore {
                self.ignore_batch(&mut batch).await
            } else {
                self.extract_batch(&node, &mut batch).await
            };
            extracted_channels.insert(batch.channel_id.clone());
            match result {
                Ok(Some(bytes)) => {
                    extracted.payload.extend_from_slice(&bytes);
                    extracted.batches.push(batch);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        "Failed to extract batch {}-{}: {:#}",
                        batch.node_id,
                        batch.batch_id,
                        e
                    );
                    failed_channels.insert(batch.channel_id.clone());
                }
            }

            if extracted.payload.len() as u64 >= self.max_bytes_to_sync && index + 1 < total {
                tracing::info!(
                    "Reached the total byte threshold of {} bytes after {} of {} batches were extracted for node '{}'. The remaining batches will be extracted on a subsequent sync",
                    self.max_bytes_to_sync,
                    index + 1,
                    total,
                    node_id
                );
                break;
            }
        }

        let now = Utc::now();
        for channel_id in extracted_channels {
            if let Some(node_channel) = channels.get(&channel_id) {
                let mut control = node_channel.to_control();
                control.last_extract_time = Some(now);
                self.config.save_node_channel_control(&control).await?;
            }
        }

        extracted.extracted_at = Instant::now();
        Ok(extracted)
    }

    /// Move transmitted batches from `SE` to `LD`.
    pub async fn mark_transmitted(
        &self,
        batches: &mut [OutgoingBatch],
        extracted_at: Instant,
        network_millis: i64,
    ) -> Result<()> {
        for batch in batches.iter_mut() {
            if batch.status != OutgoingBatchStatus::Sending {
                continue;
            }
            batch.network_millis = network_millis;
            batch.load_count += 1;
            let mut last_read = extracted_at;
            self.change_status(batch, OutgoingBatchStatus::Loading, &mut last_read)
                .await?;
        }
        Ok(())
    }

    async fn ignore_batch(&self, batch: &mut OutgoingBatch) -> Result<Option<Vec<u8>>> {
        if batch.status != OutgoingBatchStatus::Ignored {
            batch.transition(OutgoingBatchStatus::Ignored)?;
        }
        batch.ignore_count += 1;
        self.outgoing.update_outgoing_batch(batch).await?;

        let mut header = BatchHeader::new(
            batch.batch_id,
            self.config.identity().node_id.clone(),
            batch.channel_id.clone(),
        );
        header.ignored = true;
        let mut writer = ProtocolWriter::new(Vec::new());
        writer.start_batch(&header)?;
        writer.end_batch(batch.batch_id)?;
        Ok(Some(writer.into_inner()))
    }

    async fn extract_batch(&self, node: &Node, batch: &mut OutgoingBatch) -> Result<Option<Vec<u8>>> {
        batch.begin_attempt();
        match self.extract_batch_payload(node, batch).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.record_failure(batch, &e).await;
                Err(e)
            }
        }
    }

    async fn extract_batch_payload(
        &self,
        node: &Node,
        batch: &mut OutgoingBatch,
    ) -> Result<Option<Vec<u8>>> {
        let mut last_read = Instant::now();
        let started = Instant::now();
        let id = StagedResourceId::outgoing(&batch.node_id, batch.batch_id);

        let staged = if self.stream_to_file {
            match self.staging.find(&id).await? {
                Some(resource) if resource.state == ResourceState::Ready => self.staging.read(&id).await?,
                _ => None,
            }
        } else {
            None
        };

        let bytes = match staged {
            Some(bytes) => {
                tracing::debug!(
                    "Sending the staged payload of batch {}-{} again",
                    batch.node_id,
                    batch.batch_id
                );
                bytes
            }
            None => {
                if matches!(
                    batch.status,
                    OutgoingBatchStatus::New | OutgoingBatchStatus::Querying | OutgoingBatchStatus::Error
                ) && !self
                    .change_status(batch, OutgoingBatchStatus::Querying, &mut last_read)
                    .await?
                {
                    return Ok(None);
                }
                batch.extract_count += 1;
                let bytes = self.write_batch(node, batch).await?;
                batch.extract_millis = started.elapsed().as_millis() as i64;
                if self.stream_to_file {
                    self.staging.write(&id, &bytes).await?;
                }
                bytes
            }
        };

        batch.byte_count = bytes.len() as i64;
        batch.sent_count += 1;
        if !self
            .change_status(batch, OutgoingBatchStatus::Sending, &mut last_read)
            .await?
        {
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    /// Persist a status change, first re-reading the batch when our copy is
    /// older than the requery interval. Returns false when the batch was
    /// finished by someone else in the meantime.
    async fn change_status(
        &self,
        batch: &mut OutgoingBatch,
        next: OutgoingBatchStatus,
        last_read: &mut Instant,
    ) -> Result<bool> {
        if last_read.elapsed() >= self.requery_interval {
            if let Some(current) = self
                .outgoing
                .find_outgoing_batch(batch.batch_id, &batch.node_id)
                .await?
            {
                if current.status == OutgoingBatchStatus::Ok {
                    tracing::info!(
                        "Batch {}-{} was marked OK while it was being sent, skipping it",
                        batch.node_id,
                        batch.batch_id
                    );
                    *batch = current;
                    return Ok(false);
                }
            }
            *last_read = Instant::now();
        }
        batch.transition(next)?;
        self.outgoing.update_outgoing_batch(batch).await?;
        Ok(true)
    }

    async fn record_failure(&self, batch: &mut OutgoingBatch, error: &anyhow::Error) {
        batch.revert_stats_on_error();
        batch.set_sql_error(&SyncError::sql_error_of(error));
        batch.error_flag = true;
        if batch.status.can_transition_to(OutgoingBatchStatus::Error) {
            batch.status = OutgoingBatchStatus::Error;
        }
        if let Err(e) = self.outgoing.update_outgoing_batch(batch).await {
            tracing::error!(
                "Failed to record the error of batch {}-{}: {:#}",
                batch.node_id,
                batch.batch_id,
                e
            );
        }
        if matches!(SyncError::find(error), Some(SyncError::Protocol { .. })) {
            let id = StagedResourceId::outgoing(&batch.node_id, batch.batch_id);
            if let Err(e) = self.staging.delete(&id).await {
                tracing::warn!("Failed to delete staged resource {}: {:#}", id, e);
            }
        }
    }

    async fn write_batch(&self, node: &Node, batch: &OutgoingBatch) -> Result<Vec<u8>> {
        let rows = self.store.select_data_for_batch(batch.batch_id).await?;
        let mut writer = ProtocolWriter::new(Vec::new());
        writer.start_batch(&BatchHeader::new(
            batch.batch_id,
            self.config.identity().node_id.clone(),
            batch.channel_id.clone(),
        ))?;

        let mut layouts: HashMap<i64, TableLayout> = HashMap::new();
        for data in &rows {
            let history = self
                .config
                .trigger_history(data.trigger_hist_id)
                .await?
                .ok_or_else(|| {
                    SyncError::Configuration(format!(
                        "Could not find trigger history {} for data {}",
                        data.trigger_hist_id, data.data_id
                    ))
                })?;
            if !layouts.contains_key(&history.trigger_hist_id) {
                let router = self.router_for(&history.trigger_id, &node.node_group_id).await?;
                let base = target_table(&history, router.as_ref());
                let plan = self.transforms.plan(TransformPoint::Extract, &base);
                let header = plan.as_ref().map_or(base, |p| p.header().clone());
                layouts.insert(history.trigger_hist_id, TableLayout { header, plan });
            }
            let layout = &layouts[&history.trigger_hist_id];

            writer.write_table(&layout.header)?;
            for record in self.records_for(data, &history).await? {
                match &layout.plan {
                    Some(plan) => writer.write_data(&plan.apply(&record))?,
                    None => writer.write_data(&record)?,
                }
            }
        }
        writer.end_batch(batch.batch_id)?;
        Ok(writer.into_inner())
    }

    async fn router_for(&self, trigger_id: &str, target_node_group_id: &str) -> Result<Option<Router>> {
        Ok(self
            .config
            .trigger_routers_for_trigger(trigger_id)
            .await?
            .into_iter()
            .find(|tr| tr.router.target_node_group_id == target_node_group_id)
            .map(|tr| tr.router))
    }

    /// Payload records for a change row. A reload expands into one insert per table row.
    async fn records_for(&self, data: &Data, history: &TriggerHistory) -> Result<Vec<CsvData>> {
        let missing = |what: &str| anyhow!("Data {} has no {} values", data.data_id, what);
        let record = match data.event_type {
            DataEventType::Insert => {
                CsvData::insert(data.row_data.clone().ok_or_else(|| missing("row"))?)
            }
            DataEventType::Update => {
                let row = data.row_data.clone().ok_or_else(|| missing("row"))?;
                let pk = data.pk_data.clone().unwrap_or_else(|| history.pk_values(&row));
                CsvData::update(row, pk, data.old_data.clone())
            }
            DataEventType::Delete => {
                let pk = match (&data.pk_data, &data.old_data) {
                    (Some(pk), _) => pk.clone(),
                    (None, Some(old)) => history.pk_values(old),
                    (None, None) => return Err(missing("key")),
                };
                CsvData::delete(pk, data.old_data.clone())
            }
            DataEventType::Sql => CsvData::sql(first_value(&data.row_data).unwrap_or_default()),
            DataEventType::Create => {
                let mut record = CsvData::sql(first_value(&data.row_data).unwrap_or_default());
                record.event_type = DataEventType::Create;
                record
            }
            DataEventType::Reload => {
                let source = self.initial_load.as_ref().ok_or_else(|| {
                    SyncError::Configuration(format!(
                        "No initial load source is configured to reload {}",
                        history.fully_qualified_table_name()
                    ))
                })?;
                let condition = first_value(&data.row_data);
                let rows = source.select_rows(history, condition.as_deref()).await?;
                tracing::debug!(
                    "Reloading {} rows of {} in data {}",
                    rows.len(),
                    history.fully_qualified_table_name(),
                    data.data_id
                );
                return Ok(rows.into_iter().map(CsvData::insert).collect());
            }
        };
        Ok(vec![record])
    }
}

fn first_value(values: &Option<RowValues>) -> Option<String> {
    values.as_ref().and_then(|v| v.first().cloned().flatten())
}

/// Table identity written for a history: the source names, overridden by
/// the router's target names. Column layout always comes from the history.
fn target_table(history: &TriggerHistory, router: Option<&Router>) -> TableHeader {
    let mut header = TableHeader::new(
        history.source_table_name.clone(),
        history.column_names.clone(),
        history.pk_column_names.clone(),
    );
    if router.map_or(true, |r| r.use_source_catalog_schema) {
        header.catalog_name = history.source_catalog_name.clone();
        header.schema_name = history.source_schema_name.clone();
    }
    if let Some(router) = router {
        if let Some(catalog) = override_value(&router.target_catalog_name) {
            header.catalog_name = catalog;
        }
        if let Some(schema) = override_value(&router.target_schema_name) {
            header.schema_name = schema;
        }
        if let Some(Some(table)) = override_value(&router.target_table_name) {
            header.table_name = table;
        }
    }
    header
}

/// `None` when the router sets nothing, `Some(None)` for the `NONE` value.
fn override_value(value: &Option<String>) -> Option<Option<String>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(v) if v.eq_ignore_ascii_case(NONE_VALUE) => Some(None),
        Some(v) => Some(Some(v.to_string())),
    }
}
