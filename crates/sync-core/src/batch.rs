//! Outgoing and incoming batch records and their status state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SqlError, SyncError};
use crate::model::{DataEventType, RowValues, UNROUTED_NODE_ID};

/// Status of an outgoing batch.
///
/// Normal flow is `RT → NE → QY → SE → LD → OK`. `ER` is reachable from any
/// non-terminal state and `IG` from `NE`. Failed or unacknowledged batches
/// are re-extracted or re-sent from `QY`, `SE`, `LD` and `ER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutgoingBatchStatus {
    #[serde(rename = "RT")]
    Routing,
    #[serde(rename = "NE")]
    New,
    #[serde(rename = "QY")]
    Querying,
    #[serde(rename = "SE")]
    Sending,
    #[serde(rename = "LD")]
    Loading,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ER")]
    Error,
    #[serde(rename = "IG")]
    Ignored,
}

impl OutgoingBatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            OutgoingBatchStatus::Routing => "RT",
            OutgoingBatchStatus::New => "NE",
            OutgoingBatchStatus::Querying => "QY",
            OutgoingBatchStatus::Sending => "SE",
            OutgoingBatchStatus::Loading => "LD",
            OutgoingBatchStatus::Ok => "OK",
            OutgoingBatchStatus::Error => "ER",
            OutgoingBatchStatus::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "RT" => Some(OutgoingBatchStatus::Routing),
            "NE" => Some(OutgoingBatchStatus::New),
            "QY" => Some(OutgoingBatchStatus::Querying),
            "SE" => Some(OutgoingBatchStatus::Sending),
            "LD" => Some(OutgoingBatchStatus::Loading),
            "OK" => Some(OutgoingBatchStatus::Ok),
            "ER" => Some(OutgoingBatchStatus::Error),
            "IG" => Some(OutgoingBatchStatus::Ignored),
            _ => None,
        }
    }

    /// Statuses picked up by extraction for a node.
    pub fn extractable() -> &'static [OutgoingBatchStatus] {
        &[
            OutgoingBatchStatus::New,
            OutgoingBatchStatus::Querying,
            OutgoingBatchStatus::Sending,
            OutgoingBatchStatus::Loading,
            OutgoingBatchStatus::Error,
            OutgoingBatchStatus::Ignored,
        ]
    }

    /// Whether an automatic transition from `self` to `next` is allowed.
    ///
    /// Forcing a batch to `OK` is not covered here; see [`OutgoingBatch::force_ok`].
    pub fn can_transition_to(&self, next: OutgoingBatchStatus) -> bool {
        use OutgoingBatchStatus::*;
        match (self, next) {
            (Ok, _) => false,
            (Routing, New) | (Routing, Ok) => true,
            (New, Querying) | (New, Ignored) => true,
            (Querying, Querying) | (Querying, Sending) => true,
            (Sending, Sending) | (Sending, Loading) => true,
            (Loading, Sending) | (Loading, Loading) | (Loading, Ok) => true,
            (Error, Querying) | (Error, Sending) => true,
            (Ignored, Ok) | (Ignored, Ignored) => true,
            (New | Querying | Sending | Loading | Error, Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OutgoingBatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Counters that a failed extraction or send attempt must roll back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AttemptStats {
    byte_count: i64,
    extract_millis: i64,
    network_millis: i64,
    filter_millis: i64,
    load_millis: i64,
}

/// The unit of transactional delivery to one target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    /// Zero or negative until the store assigns an id.
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: OutgoingBatchStatus,
    pub load_flag: bool,
    pub error_flag: bool,
    /// The batch id is shared with other nodes' batches of the same wave.
    pub common_flag: bool,
    pub ignore_count: i64,
    pub byte_count: i64,
    pub extract_count: i64,
    pub sent_count: i64,
    pub load_count: i64,
    pub data_event_count: i64,
    pub reload_event_count: i64,
    pub insert_event_count: i64,
    pub update_event_count: i64,
    pub delete_event_count: i64,
    pub other_event_count: i64,
    pub router_millis: i64,
    pub network_millis: i64,
    pub filter_millis: i64,
    pub load_millis: i64,
    pub extract_millis: i64,
    pub failed_data_id: i64,
    pub sql_state: Option<String>,
    pub sql_code: i32,
    pub sql_message: Option<String>,
    pub last_update_hostname: Option<String>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    #[serde(skip)]
    attempt: Option<AttemptStats>,
}

impl OutgoingBatch {
    pub fn new(
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        status: OutgoingBatchStatus,
    ) -> Self {
        Self {
            batch_id: -1,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status,
            load_flag: false,
            error_flag: false,
            common_flag: false,
            ignore_count: 0,
            byte_count: 0,
            extract_count: 0,
            sent_count: 0,
            load_count: 0,
            data_event_count: 0,
            reload_event_count: 0,
            insert_event_count: 0,
            update_event_count: 0,
            delete_event_count: 0,
            other_event_count: 0,
            router_millis: 0,
            network_millis: 0,
            filter_millis: 0,
            load_millis: 0,
            extract_millis: 0,
            failed_data_id: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            last_update_hostname: None,
            last_update_time: None,
            create_time: Utc::now(),
            attempt: None,
        }
    }

    pub fn is_unrouted(&self) -> bool {
        self.node_id == UNROUTED_NODE_ID
    }

    pub fn increment_event_count(&mut self, event_type: DataEventType) {
        match event_type {
            DataEventType::Insert => self.insert_event_count += 1,
            DataEventType::Update => self.update_event_count += 1,
            DataEventType::Delete => self.delete_event_count += 1,
            DataEventType::Reload => {
                self.reload_event_count += 1;
                self.load_flag = true;
            }
            _ => self.other_event_count += 1,
        }
    }

    pub fn increment_data_event_count(&mut self) {
        self.data_event_count += 1;
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: OutgoingBatchStatus) -> Result<(), SyncError> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::IllegalStatusTransition {
                batch_id: self.batch_id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Operator or acknowledgment override to `OK` from any status.
    ///
    /// Returns the previous status when it was not already `OK`.
    pub fn force_ok(&mut self) -> Option<OutgoingBatchStatus> {
        if self.status == OutgoingBatchStatus::Ok {
            return None;
        }
        let previous = self.status;
        self.status = OutgoingBatchStatus::Ok;
        Some(previous)
    }

    /// Remember the counters an extraction or send attempt may change.
    pub fn begin_attempt(&mut self) {
        self.attempt = Some(AttemptStats {
            byte_count: self.byte_count,
            extract_millis: self.extract_millis,
            network_millis: self.network_millis,
            filter_millis: self.filter_millis,
            load_millis: self.load_millis,
        });
    }

    /// Roll back counters changed since [`begin_attempt`](Self::begin_attempt).
    pub fn revert_stats_on_error(&mut self) {
        if let Some(saved) = self.attempt.take() {
            self.byte_count = saved.byte_count;
            self.extract_millis = saved.extract_millis;
            self.network_millis = saved.network_millis;
            self.filter_millis = saved.filter_millis;
            self.load_millis = saved.load_millis;
        }
    }

    pub fn set_sql_error(&mut self, error: &SqlError) {
        self.sql_state = error.state.clone();
        self.sql_code = error.code;
        self.sql_message = Some(error.message.clone());
    }

    pub fn clear_error(&mut self) {
        self.error_flag = false;
        self.failed_data_id = 0;
        self.sql_state = None;
        self.sql_code = 0;
        self.sql_message = None;
    }

    pub fn total_event_count(&self) -> i64 {
        self.insert_event_count
            + self.update_event_count
            + self.delete_event_count
            + self.reload_event_count
            + self.other_event_count
    }
}

/// Status of a batch on the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingBatchStatus {
    #[serde(rename = "LD")]
    Loading,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ER")]
    Error,
    #[serde(rename = "IG")]
    Ignored,
}

impl IncomingBatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            IncomingBatchStatus::Loading => "LD",
            IncomingBatchStatus::Ok => "OK",
            IncomingBatchStatus::Error => "ER",
            IncomingBatchStatus::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "LD" => Some(IncomingBatchStatus::Loading),
            "OK" => Some(IncomingBatchStatus::Ok),
            "ER" => Some(IncomingBatchStatus::Error),
            "IG" => Some(IncomingBatchStatus::Ignored),
            _ => None,
        }
    }

    /// A batch in this status has already been applied (or deliberately skipped).
    pub fn is_applied(&self) -> bool {
        matches!(self, IncomingBatchStatus::Ok | IncomingBatchStatus::Ignored)
    }
}

impl std::fmt::Display for IncomingBatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Receiving-node record of a batch accepted for loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingBatch {
    pub batch_id: i64,
    /// Node the batch came from.
    pub node_id: String,
    pub channel_id: String,
    pub status: IncomingBatchStatus,
    pub error_flag: bool,
    pub network_millis: i64,
    pub filter_millis: i64,
    pub database_millis: i64,
    pub byte_count: i64,
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub ignore_count: i64,
    pub missing_delete_count: i64,
    pub skip_count: i64,
    /// 1-based position of the failing row within the batch.
    pub failed_row_number: i64,
    /// 1-based payload line of the failing row.
    pub failed_line_number: i64,
    pub sql_state: Option<String>,
    pub sql_code: i32,
    pub sql_message: Option<String>,
    pub last_update_hostname: Option<String>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    /// Set for the lifetime of a load attempt when the batch is being re-applied after an error.
    #[serde(skip)]
    pub retry: bool,
    /// Set for the lifetime of a load attempt when the batch was already applied.
    #[serde(skip)]
    pub skipped: bool,
}

impl IncomingBatch {
    pub fn new(batch_id: i64, node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: IncomingBatchStatus::Loading,
            error_flag: false,
            network_millis: 0,
            filter_millis: 0,
            database_millis: 0,
            byte_count: 0,
            statement_count: 0,
            fallback_insert_count: 0,
            fallback_update_count: 0,
            ignore_count: 0,
            missing_delete_count: 0,
            skip_count: 0,
            failed_row_number: 0,
            failed_line_number: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            last_update_hostname: None,
            last_update_time: None,
            create_time: Utc::now(),
            retry: false,
            skipped: false,
        }
    }

    pub fn set_sql_error(&mut self, error: &SqlError) {
        self.sql_state = error.state.clone();
        self.sql_code = error.code;
        self.sql_message = Some(error.message.clone());
    }

    /// Reset load statistics before re-applying a batch.
    pub fn reset_stats(&mut self) {
        self.error_flag = false;
        self.network_millis = 0;
        self.filter_millis = 0;
        self.database_millis = 0;
        self.byte_count = 0;
        self.statement_count = 0;
        self.fallback_insert_count = 0;
        self.fallback_update_count = 0;
        self.ignore_count = 0;
        self.missing_delete_count = 0;
        self.failed_row_number = 0;
        self.failed_line_number = 0;
        self.sql_state = None;
        self.sql_code = 0;
        self.sql_message = None;
    }
}

/// Detailed record of the row that made an incoming batch fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingError {
    pub batch_id: i64,
    pub node_id: String,
    pub failed_row_number: i64,
    pub failed_line_number: i64,
    pub target_table_name: String,
    pub event_type: DataEventType,
    pub row_data: Option<RowValues>,
    pub pk_data: Option<RowValues>,
    pub old_data: Option<RowValues>,
    pub create_time: DateTime<Utc>,
}

/// Outcome of a batch as reported by the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// One acknowledgment entry sent back to the origin node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: i64,
    /// Node that loaded the batch.
    pub node_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub network_millis: i64,
    #[serde(default)]
    pub filter_millis: i64,
    #[serde(default)]
    pub database_millis: i64,
    #[serde(default)]
    pub byte_count: i64,
    /// 1-based row number of the failing row within the batch.
    #[serde(default)]
    pub error_line: i64,
    #[serde(default)]
    pub sql_state: Option<String>,
    #[serde(default)]
    pub sql_code: i32,
    #[serde(default)]
    pub sql_message: Option<String>,
    /// The batch was ignored at the target rather than loaded.
    #[serde(default)]
    pub ignored: bool,
}

impl BatchAck {
    pub fn ok(batch_id: i64, node_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            status: AckStatus::Ok,
            network_millis: 0,
            filter_millis: 0,
            database_millis: 0,
            byte_count: 0,
            error_line: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            ignored: false,
        }
    }

    /// Build the acknowledgment for an incoming batch as loaded by `local_node_id`.
    pub fn from_incoming(batch: &IncomingBatch, local_node_id: &str) -> Self {
        let ok = batch.status.is_applied() || batch.skipped;
        Self {
            batch_id: batch.batch_id,
            node_id: local_node_id.to_string(),
            status: if ok { AckStatus::Ok } else { AckStatus::Error },
            network_millis: batch.network_millis,
            filter_millis: batch.filter_millis,
            database_millis: batch.database_millis,
            byte_count: batch.byte_count,
            error_line: if ok { 0 } else { batch.failed_row_number },
            sql_state: batch.sql_state.clone(),
            sql_code: batch.sql_code,
            sql_message: batch.sql_message.clone(),
            ignored: batch.status == IncomingBatchStatus::Ignored,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OutgoingBatchStatus::*;

    #[test]
    fn test_normal_flow_is_allowed() {
        let mut batch = OutgoingBatch::new("store-001", "default", Routing);
        for next in [New, Querying, Sending, Loading, Ok] {
            batch.transition(next).unwrap();
        }
        assert_eq!(batch.status, Ok);
    }

    #[test]
    fn test_ok_is_terminal() {
        let mut batch = OutgoingBatch::new("store-001", "default", Ok);
        for next in [Routing, New, Querying, Sending, Loading, Error, Ignored, Ok] {
            assert!(batch.transition(next).is_err(), "OK -> {next} allowed");
        }
        assert_eq!(batch.force_ok(), None);
    }

    #[test]
    fn test_error_reachable_from_active_states() {
        for from in [Querying, Sending, Loading] {
            assert!(from.can_transition_to(Error), "{from} -> ER refused");
        }
        assert!(!Routing.can_transition_to(Error));
        assert!(New.can_transition_to(Ignored));
        assert!(!Querying.can_transition_to(Ignored));
    }

    #[test]
    fn test_no_backwards_skip() {
        assert!(!Sending.can_transition_to(New));
        assert!(!Loading.can_transition_to(Querying));
        assert!(!New.can_transition_to(Ok));
        assert!(!Querying.can_transition_to(Ok));
    }

    #[test]
    fn test_force_ok_reports_previous_status() {
        let mut batch = OutgoingBatch::new("store-001", "default", Error);
        assert_eq!(batch.force_ok(), Some(Error));
        assert_eq!(batch.status, Ok);
    }

    #[test]
    fn test_event_counts() {
        let mut batch = OutgoingBatch::new("store-001", "default", Routing);
        batch.increment_event_count(DataEventType::Insert);
        batch.increment_event_count(DataEventType::Insert);
        batch.increment_event_count(DataEventType::Reload);
        batch.increment_event_count(DataEventType::Sql);
        assert_eq!(batch.insert_event_count, 2);
        assert_eq!(batch.reload_event_count, 1);
        assert_eq!(batch.other_event_count, 1);
        assert!(batch.load_flag);
        assert_eq!(batch.total_event_count(), 4);
    }

    #[test]
    fn test_revert_stats_on_error() {
        let mut batch = OutgoingBatch::new("store-001", "default", New);
        batch.byte_count = 100;
        batch.begin_attempt();
        batch.byte_count += 500;
        batch.network_millis = 42;
        batch.revert_stats_on_error();
        assert_eq!(batch.byte_count, 100);
        assert_eq!(batch.network_millis, 0);
    }

    #[test]
    fn test_status_codes_round_trip() {
        for status in [Routing, New, Querying, Sending, Loading, Ok, Error, Ignored] {
            assert_eq!(OutgoingBatchStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_ack_from_failed_incoming_batch() {
        let mut incoming = IncomingBatch::new(7, "corp-000", "default");
        incoming.status = IncomingBatchStatus::Error;
        incoming.failed_row_number = 3;
        incoming.set_sql_error(&SqlError::new(Some("CONFLICT".into()), 0, "missing row"));

        let ack = BatchAck::from_incoming(&incoming, "store-001");
        assert!(!ack.is_ok());
        assert_eq!(ack.error_line, 3);
        assert_eq!(ack.node_id, "store-001");
        assert_eq!(ack.sql_state.as_deref(), Some("CONFLICT"));

        incoming.status = IncomingBatchStatus::Ok;
        assert!(BatchAck::from_incoming(&incoming, "store-001").is_ok());
    }
}
