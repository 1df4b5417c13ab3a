//! Engine tuning parameters.
//!
//! Every field has a default, so a parameters file only needs to list the
//! values it changes:
//!
//! ```toml
//! routing_peek_ahead_window = 500
//! transport_max_bytes_to_sync = 4194304
//!
//! [conflict]
//! missing_delete = "stop"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::writer::ConflictSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParameters {
    /// Identifies this process in cluster lock rows. Generated when absent.
    pub cluster_server_id: Option<String>,
    /// Use the shared lock table instead of in-process locks.
    pub cluster_lock_enabled: bool,
    pub cluster_lock_timeout_ms: u64,

    /// Rows the reader may buffer ahead of the router.
    pub routing_peek_ahead_window: usize,
    /// How long the router waits for the reader before failing the pass.
    pub routing_wait_for_data_timeout_secs: u64,
    pub routing_max_gaps_to_qualify_in_sql: usize,
    /// Above this many gaps the reader selects every id from the first gap on.
    pub routing_data_reader_threshold_gaps_to_use_greater_query: usize,
    pub routing_largest_gap_size: i64,
    pub routing_stale_data_id_gap_time_ms: i64,
    pub routing_stale_gap_busy_expire_time_ms: i64,
    pub routing_detect_invalid_gaps: bool,
    /// Pending data events are written out once this many accumulate.
    pub routing_flush_jdbc_batch_size: usize,
    pub data_id_increment_by: i64,

    pub outgoing_batches_max_to_select: usize,
    /// Force batches of nodes that no longer exist to `OK` during purge.
    pub outgoing_batches_purge_stranded: bool,
    pub transport_max_bytes_to_sync: u64,
    /// Re-read a batch row before a status change when it is older than this.
    pub extract_requery_interval_ms: u64,
    pub stream_to_file_enabled: bool,

    pub num_of_ack_retries: u32,
    pub time_between_ack_retries_ms: u64,

    pub cache_timeout_channel_ms: u64,
    pub cache_timeout_node_ms: u64,
    pub cache_timeout_trigger_router_ms: u64,

    pub conflict: ConflictSettings,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            cluster_server_id: None,
            cluster_lock_enabled: false,
            cluster_lock_timeout_ms: 30 * 60 * 1000,
            routing_peek_ahead_window: 1000,
            routing_wait_for_data_timeout_secs: 330,
            routing_max_gaps_to_qualify_in_sql: 100,
            routing_data_reader_threshold_gaps_to_use_greater_query: 100,
            routing_largest_gap_size: 50_000_000,
            routing_stale_data_id_gap_time_ms: 20 * 60 * 1000,
            routing_stale_gap_busy_expire_time_ms: 20 * 60 * 1000,
            routing_detect_invalid_gaps: true,
            routing_flush_jdbc_batch_size: 50_000,
            data_id_increment_by: 1,
            outgoing_batches_max_to_select: 50_000,
            outgoing_batches_purge_stranded: true,
            transport_max_bytes_to_sync: 1_048_576,
            extract_requery_interval_ms: 5000,
            stream_to_file_enabled: true,
            num_of_ack_retries: 5,
            time_between_ack_retries_ms: 5000,
            cache_timeout_channel_ms: 10 * 60 * 1000,
            cache_timeout_node_ms: 10 * 60 * 1000,
            cache_timeout_trigger_router_ms: 10 * 60 * 1000,
            conflict: ConflictSettings::default(),
        }
    }
}

impl EngineParameters {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse parameters file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn cluster_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_lock_timeout_ms)
    }

    pub fn routing_wait_for_data_timeout(&self) -> Duration {
        Duration::from_secs(self.routing_wait_for_data_timeout_secs)
    }

    pub fn extract_requery_interval(&self) -> Duration {
        Duration::from_millis(self.extract_requery_interval_ms)
    }

    pub fn time_between_ack_retries(&self) -> Duration {
        Duration::from_millis(self.time_between_ack_retries_ms)
    }
}
