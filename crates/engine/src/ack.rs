//! Applying acknowledgments from target nodes to outgoing batches.

use anyhow::{Context, Result};
use std::sync::Arc;

use staging::{ResourceState, StagedResourceId, StagingArea};
use sync_core::{BatchAck, OutgoingBatchStatus, SqlError, Store};

use crate::outgoing::OutgoingBatchService;

/// Serialize acknowledgments as JSON lines, one ack per line.
pub fn encode_acks(acks: &[BatchAck]) -> Result<String> {
    let mut out = String::new();
    for ack in acks {
        out.push_str(&serde_json::to_string(ack)?);
        out.push('\n');
    }
    Ok(out)
}

pub fn decode_acks(content: &str) -> Result<Vec<BatchAck>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid acknowledgment on line {}", i + 1))
        })
        .collect()
}

pub struct AcknowledgeService {
    store: Arc<dyn Store>,
    outgoing: Arc<OutgoingBatchService>,
    staging: Arc<dyn StagingArea>,
}

impl AcknowledgeService {
    pub fn new(
        store: Arc<dyn Store>,
        outgoing: Arc<OutgoingBatchService>,
        staging: Arc<dyn StagingArea>,
    ) -> Self {
        Self {
            store,
            outgoing,
            staging,
        }
    }

    /// Apply acknowledgments, returning how many batches changed.
    ///
    /// Unknown batches are logged and dropped: a batch that never gets its
    /// acknowledgment stays unfinished and is sent again.
    pub async fn ack(&self, acks: &[BatchAck]) -> Result<usize> {
        let mut updated = 0;
        for ack in acks {
            if self.ack_batch(ack).await? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn ack_batch(&self, ack: &BatchAck) -> Result<bool> {
        let Some(mut batch) = self
            .outgoing
            .find_outgoing_batch(ack.batch_id, &ack.node_id)
            .await?
        else {
            tracing::error!(
                "Could not find batch {}-{} to acknowledge as {}",
                ack.node_id,
                ack.batch_id,
                if ack.is_ok() { "OK" } else { "ER" }
            );
            return Ok(false);
        };
        if batch.status == OutgoingBatchStatus::Ok {
            tracing::debug!("Batch {}-{} was already acknowledged", ack.node_id, ack.batch_id);
            return Ok(false);
        }

        batch.network_millis = ack.network_millis;
        batch.filter_millis = ack.filter_millis;
        batch.load_millis = ack.database_millis;

        if ack.is_ok() {
            if batch.status.can_transition_to(OutgoingBatchStatus::Ok) {
                batch.transition(OutgoingBatchStatus::Ok)?;
            } else if let Some(previous) = batch.force_ok() {
                tracing::warn!(
                    "Batch {}-{} was acknowledged while in status {}, setting it to OK",
                    ack.node_id,
                    ack.batch_id,
                    previous
                );
            }
            if ack.ignored {
                batch.ignore_count += 1;
            }
            batch.clear_error();
            self.staging
                .set_state(&StagedResourceId::outgoing(&batch.node_id, batch.batch_id), ResourceState::Done)
                .await?;
        } else {
            if !batch.status.can_transition_to(OutgoingBatchStatus::Error) {
                tracing::warn!(
                    "Ignoring error acknowledgment for batch {}-{} in status {}",
                    ack.node_id,
                    ack.batch_id,
                    batch.status
                );
                return Ok(false);
            }
            batch.transition(OutgoingBatchStatus::Error)?;
            batch.error_flag = true;
            batch.set_sql_error(&SqlError::new(
                ack.sql_state.clone(),
                ack.sql_code,
                ack.sql_message.clone().unwrap_or_default(),
            ));
            if ack.error_line > 0 {
                let data_ids = self.store.select_data_ids_for_batch(batch.batch_id).await?;
                if let Some(data_id) = data_ids.get((ack.error_line - 1) as usize) {
                    batch.failed_data_id = *data_id;
                }
            }
            tracing::warn!(
                "Batch {}-{} failed to load at row {}: {}",
                ack.node_id,
                ack.batch_id,
                ack.error_line,
                batch.sql_message.as_deref().unwrap_or("")
            );
        }
        self.outgoing.update_outgoing_batch(&mut batch).await?;
        Ok(true)
    }
}
