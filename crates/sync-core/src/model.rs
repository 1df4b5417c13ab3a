//! Replication model: captured change rows, trigger histories, nodes,
//! channels and the routing configuration that binds them together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node id of the pseudo-node that owns change rows no target node wanted.
pub const UNROUTED_NODE_ID: &str = "-1";

/// Router id recorded on data events whose row had no trigger router.
pub const UNKNOWN_ROUTER_ID: &str = "?";

/// Channel carrying configuration table changes.
pub const CHANNEL_CONFIG: &str = "config";

/// Channel carrying initial-load (reload) events.
pub const CHANNEL_RELOAD: &str = "reload";

/// Channel carrying heartbeat events.
pub const CHANNEL_HEARTBEAT: &str = "heartbeat";

/// Channel used when a trigger names none.
pub const CHANNEL_DEFAULT: &str = "default";

/// Column values of one captured row. `None` is SQL NULL.
pub type RowValues = Vec<Option<String>>;

/// Kind of change a captured row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataEventType {
    Insert,
    Update,
    Delete,
    /// Full-table snapshot request for one table and one target node.
    Reload,
    /// Raw SQL to replay at the target.
    Sql,
    /// Table creation request.
    Create,
}

impl DataEventType {
    /// Single-letter code persisted in the change log.
    pub fn code(&self) -> &'static str {
        match self {
            DataEventType::Insert => "I",
            DataEventType::Update => "U",
            DataEventType::Delete => "D",
            DataEventType::Reload => "R",
            DataEventType::Sql => "S",
            DataEventType::Create => "C",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(DataEventType::Insert),
            "U" => Some(DataEventType::Update),
            "D" => Some(DataEventType::Delete),
            "R" => Some(DataEventType::Reload),
            "S" => Some(DataEventType::Sql),
            "C" => Some(DataEventType::Create),
            _ => None,
        }
    }

    /// Whether the event is a row-level insert, update or delete.
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            DataEventType::Insert | DataEventType::Update | DataEventType::Delete
        )
    }
}

impl std::fmt::Display for DataEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataEventType::Insert => "INSERT",
            DataEventType::Update => "UPDATE",
            DataEventType::Delete => "DELETE",
            DataEventType::Reload => "RELOAD",
            DataEventType::Sql => "SQL",
            DataEventType::Create => "CREATE",
        };
        f.write_str(name)
    }
}

/// A captured change row.
///
/// Rows are written once by the capture triggers and never mutated. The
/// table shape needed to interpret `row_data` comes from the
/// [`TriggerHistory`] named by `trigger_hist_id`, not from the live table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// Monotonic change log id. Zero until the row has been stored.
    pub data_id: i64,
    pub table_name: String,
    pub event_type: DataEventType,
    /// New values (insert/update), the where clause (reload) or the statement (sql).
    pub row_data: Option<RowValues>,
    /// Primary key values before the change (update/delete).
    pub pk_data: Option<RowValues>,
    /// Old values before the change (update/delete).
    pub old_data: Option<RowValues>,
    pub trigger_hist_id: i64,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    /// Node the change was loaded from, when it arrived through replication.
    pub source_node_id: Option<String>,
    pub external_data: Option<String>,
    /// Comma separated node ids this row is restricted to.
    pub node_list: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl Data {
    pub fn new(
        table_name: impl Into<String>,
        event_type: DataEventType,
        trigger_hist_id: i64,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            data_id: 0,
            table_name: table_name.into(),
            event_type,
            row_data: None,
            pk_data: None,
            old_data: None,
            trigger_hist_id,
            channel_id: channel_id.into(),
            transaction_id: None,
            source_node_id: None,
            external_data: None,
            node_list: None,
            create_time: Utc::now(),
        }
    }

    pub fn with_row_data(mut self, values: RowValues) -> Self {
        self.row_data = Some(values);
        self
    }

    pub fn with_pk_data(mut self, values: RowValues) -> Self {
        self.pk_data = Some(values);
        self
    }

    pub fn with_old_data(mut self, values: RowValues) -> Self {
        self.old_data = Some(values);
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_source_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.source_node_id = Some(node_id.into());
        self
    }

    pub fn with_node_list(mut self, node_list: impl Into<String>) -> Self {
        self.node_list = Some(node_list.into());
        self
    }

    pub fn with_external_data(mut self, external_data: impl Into<String>) -> Self {
        self.external_data = Some(external_data.into());
        self
    }

    /// Node ids this row is explicitly addressed to, if any.
    pub fn target_node_ids(&self) -> Option<Vec<&str>> {
        self.node_list.as_deref().map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .collect()
        })
    }
}

/// Versioned snapshot of a source table's shape at trigger install time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerHistory {
    pub trigger_hist_id: i64,
    pub trigger_id: String,
    pub source_table_name: String,
    #[serde(default)]
    pub source_catalog_name: Option<String>,
    #[serde(default)]
    pub source_schema_name: Option<String>,
    pub column_names: Vec<String>,
    pub pk_column_names: Vec<String>,
    #[serde(default)]
    pub table_hash: i64,
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub inactive_time: Option<DateTime<Utc>>,
}

impl TriggerHistory {
    pub fn new(
        trigger_hist_id: i64,
        trigger_id: impl Into<String>,
        source_table_name: impl Into<String>,
        column_names: Vec<String>,
        pk_column_names: Vec<String>,
    ) -> Self {
        let table_hash = Self::compute_table_hash(&column_names, &pk_column_names);
        Self {
            trigger_hist_id,
            trigger_id: trigger_id.into(),
            source_table_name: source_table_name.into(),
            source_catalog_name: None,
            source_schema_name: None,
            column_names,
            pk_column_names,
            table_hash,
            create_time: Utc::now(),
            inactive_time: None,
        }
    }

    /// Shape hash over column and key names, in order.
    pub fn compute_table_hash(column_names: &[String], pk_column_names: &[String]) -> i64 {
        let mut hash: i64 = 17;
        for name in column_names {
            for b in name.bytes() {
                hash = hash.wrapping_mul(31).wrapping_add(i64::from(b));
            }
            hash = hash.wrapping_mul(31).wrapping_add(i64::from(b','));
        }
        for name in pk_column_names {
            for b in name.bytes() {
                hash = hash.wrapping_mul(37).wrapping_add(i64::from(b));
            }
            hash = hash.wrapping_mul(37).wrapping_add(i64::from(b';'));
        }
        hash
    }

    /// Whether a live table shape differs from the shape this history captured.
    pub fn shape_differs(&self, column_names: &[String], pk_column_names: &[String]) -> bool {
        self.table_hash != Self::compute_table_hash(column_names, pk_column_names)
    }

    pub fn is_active(&self) -> bool {
        self.inactive_time.is_none()
    }

    pub fn fully_qualified_table_name(&self) -> String {
        qualify(
            self.source_catalog_name.as_deref(),
            self.source_schema_name.as_deref(),
            &self.source_table_name,
        )
    }

    pub fn column_index(&self, column_name: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column_name))
    }

    /// Pick the primary key values out of a full row in history column order.
    pub fn pk_values(&self, row: &[Option<String>]) -> RowValues {
        self.pk_column_names
            .iter()
            .map(|pk| {
                self.column_index(pk)
                    .and_then(|i| row.get(i).cloned())
                    .flatten()
            })
            .collect()
    }
}

/// Join catalog, schema and table into a dotted name, skipping absent parts.
pub fn qualify(catalog: Option<&str>, schema: Option<&str>, table: &str) -> String {
    let mut name = String::new();
    for part in [catalog, schema].into_iter().flatten() {
        if !part.is_empty() {
            name.push_str(part);
            name.push('.');
        }
    }
    name.push_str(table);
    name
}

/// A participant in the replication topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    pub external_id: String,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
    #[serde(default)]
    pub sync_url: Option<String>,
}

impl Node {
    pub fn new(
        node_id: impl Into<String>,
        node_group_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            external_id: external_id.into(),
            sync_enabled: true,
            sync_url: None,
        }
    }
}

/// How data moves across a node group link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeGroupLinkAction {
    /// The source pushes batches to the target.
    #[serde(rename = "P", alias = "push")]
    Push,
    /// The source waits for the target to pull.
    #[serde(rename = "W", alias = "pull")]
    WaitForPull,
}

impl NodeGroupLinkAction {
    pub fn code(&self) -> &'static str {
        match self {
            NodeGroupLinkAction::Push => "P",
            NodeGroupLinkAction::WaitForPull => "W",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(NodeGroupLinkAction::Push),
            "W" => Some(NodeGroupLinkAction::WaitForPull),
            _ => None,
        }
    }
}

/// Directed permission for one node group to send changes to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeGroupLink {
    pub source_node_group_id: String,
    pub target_node_group_id: String,
    #[serde(default = "default_link_action")]
    pub data_event_action: NodeGroupLinkAction,
}

/// A lane of change traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    #[serde(default)]
    pub processing_order: i32,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_to_send")]
    pub max_batch_to_send: usize,
    #[serde(default = "default_max_data_to_route")]
    pub max_data_to_route: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name of the batch completion algorithm: `default`, `transactional` or `nontransactional`.
    #[serde(default = "default_batch_algorithm")]
    pub batch_algorithm: String,
    #[serde(default)]
    pub contains_big_lob: bool,
    #[serde(default)]
    pub reload_flag: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, processing_order: i32) -> Self {
        Self {
            channel_id: channel_id.into(),
            processing_order,
            max_batch_size: default_max_batch_size(),
            max_batch_to_send: default_max_batch_to_send(),
            max_data_to_route: default_max_data_to_route(),
            enabled: true,
            batch_algorithm: default_batch_algorithm(),
            contains_big_lob: false,
            reload_flag: false,
            description: None,
        }
    }

    pub fn with_batch_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.batch_algorithm = algorithm.into();
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn is_nontransactional(&self) -> bool {
        self.batch_algorithm == "nontransactional"
    }
}

/// Persisted runtime controls for one (node, channel) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChannelControl {
    pub node_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub suspend_enabled: bool,
    #[serde(default)]
    pub ignore_enabled: bool,
    #[serde(default)]
    pub last_extract_time: Option<DateTime<Utc>>,
}

impl NodeChannelControl {
    pub fn new(node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            suspend_enabled: false,
            ignore_enabled: false,
            last_extract_time: None,
        }
    }
}

/// A channel as seen from one node, with that node's runtime controls applied.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeChannel {
    pub node_id: String,
    pub channel: Channel,
    pub suspend_enabled: bool,
    pub ignore_enabled: bool,
    pub last_extract_time: Option<DateTime<Utc>>,
}

impl NodeChannel {
    pub fn new(node_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            node_id: node_id.into(),
            channel,
            suspend_enabled: false,
            ignore_enabled: false,
            last_extract_time: None,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel.channel_id
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.enabled
    }

    pub fn apply_control(&mut self, control: &NodeChannelControl) {
        self.suspend_enabled = control.suspend_enabled;
        self.ignore_enabled = control.ignore_enabled;
        self.last_extract_time = control.last_extract_time;
    }

    pub fn to_control(&self) -> NodeChannelControl {
        NodeChannelControl {
            node_id: self.node_id.clone(),
            channel_id: self.channel.channel_id.clone(),
            suspend_enabled: self.suspend_enabled,
            ignore_enabled: self.ignore_enabled,
            last_extract_time: self.last_extract_time,
        }
    }
}

/// Capture configuration for one source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: String,
    pub source_table_name: String,
    #[serde(default)]
    pub source_catalog_name: Option<String>,
    #[serde(default)]
    pub source_schema_name: Option<String>,
    #[serde(default = "default_channel")]
    pub channel_id: String,
    #[serde(default = "default_reload_channel")]
    pub reload_channel_id: String,
    #[serde(default = "default_true")]
    pub sync_on_insert: bool,
    #[serde(default = "default_true")]
    pub sync_on_update: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
    /// Capture changes that were themselves loaded by replication.
    #[serde(default)]
    pub sync_on_incoming_batch: bool,
}

impl Trigger {
    pub fn new(
        trigger_id: impl Into<String>,
        source_table_name: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            source_table_name: source_table_name.into(),
            source_catalog_name: None,
            source_schema_name: None,
            channel_id: channel_id.into(),
            reload_channel_id: default_reload_channel(),
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
            sync_on_incoming_batch: false,
        }
    }

    pub fn fully_qualified_source_table_name(&self) -> String {
        qualify(
            self.source_catalog_name.as_deref(),
            self.source_schema_name.as_deref(),
            &self.source_table_name,
        )
    }
}

/// Selects the target nodes for changes captured by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub router_id: String,
    pub source_node_group_id: String,
    pub target_node_group_id: String,
    /// Routing strategy name. Empty or unknown names fall back to `default`.
    #[serde(default = "default_router_type")]
    pub router_type: String,
    #[serde(default)]
    pub router_expression: Option<String>,
    #[serde(default)]
    pub target_catalog_name: Option<String>,
    #[serde(default)]
    pub target_schema_name: Option<String>,
    #[serde(default)]
    pub target_table_name: Option<String>,
    #[serde(default = "default_true")]
    pub sync_on_insert: bool,
    #[serde(default = "default_true")]
    pub sync_on_update: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
    #[serde(default = "default_true")]
    pub use_source_catalog_schema: bool,
}

impl Router {
    pub fn new(
        router_id: impl Into<String>,
        source_node_group_id: impl Into<String>,
        target_node_group_id: impl Into<String>,
    ) -> Self {
        Self {
            router_id: router_id.into(),
            source_node_group_id: source_node_group_id.into(),
            target_node_group_id: target_node_group_id.into(),
            router_type: default_router_type(),
            router_expression: None,
            target_catalog_name: None,
            target_schema_name: None,
            target_table_name: None,
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
            use_source_catalog_schema: true,
        }
    }

    pub fn with_type(mut self, router_type: impl Into<String>, expression: Option<&str>) -> Self {
        self.router_type = router_type.into();
        self.router_expression = expression.map(str::to_string);
        self
    }
}

/// Binding of a trigger to a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRouter {
    pub trigger: Trigger,
    pub router: Router,
    #[serde(default = "default_initial_load_order")]
    pub initial_load_order: i32,
    #[serde(default)]
    pub initial_load_select: Option<String>,
    /// Allow changes to be routed back to the node they came from.
    #[serde(default)]
    pub ping_back_enabled: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TriggerRouter {
    pub fn new(trigger: Trigger, router: Router) -> Self {
        Self {
            trigger,
            router,
            initial_load_order: default_initial_load_order(),
            initial_load_select: None,
            ping_back_enabled: false,
            enabled: true,
        }
    }

    /// Stable identity used as a cache key.
    pub fn id(&self) -> String {
        format!("{}:{}", self.trigger.trigger_id, self.router.router_id)
    }

    /// Whether this binding routes the given kind of change at all.
    pub fn is_routed(&self, event_type: DataEventType) -> bool {
        match event_type {
            DataEventType::Insert => self.trigger.sync_on_insert && self.router.sync_on_insert,
            DataEventType::Update => self.trigger.sync_on_update && self.router.sync_on_update,
            DataEventType::Delete => self.trigger.sync_on_delete && self.router.sync_on_delete,
            _ => true,
        }
    }
}

/// A range of change log ids that has not been routed yet.
///
/// Equality and ordering consider only the id range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataGap {
    pub start_id: i64,
    pub end_id: i64,
    pub create_time: DateTime<Utc>,
}

impl DataGap {
    pub fn new(start_id: i64, end_id: i64) -> Self {
        Self::created_at(start_id, end_id, Utc::now())
    }

    pub fn created_at(start_id: i64, end_id: i64, create_time: DateTime<Utc>) -> Self {
        Self {
            start_id,
            end_id,
            create_time,
        }
    }

    pub fn gap_size(&self) -> i64 {
        self.end_id - self.start_id
    }

    pub fn contains(&self, data_id: i64) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    pub fn overlaps(&self, other: &DataGap) -> bool {
        self.start_id <= other.end_id && other.start_id <= self.end_id
    }
}

impl PartialEq for DataGap {
    fn eq(&self, other: &Self) -> bool {
        self.start_id == other.start_id && self.end_id == other.end_id
    }
}

impl Eq for DataGap {}

impl std::hash::Hash for DataGap {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.start_id.hash(state);
        self.end_id.hash(state);
    }
}

impl PartialOrd for DataGap {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataGap {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.start_id, self.end_id).cmp(&(other.start_id, other.end_id))
    }
}

impl std::fmt::Display for DataGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataGap[{}-{}]", self.start_id, self.end_id)
    }
}

/// Association of a change row with the outgoing batch it was routed into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataEvent {
    pub data_id: i64,
    pub batch_id: i64,
    pub router_id: String,
}

impl DataEvent {
    pub fn new(data_id: i64, batch_id: i64, router_id: impl Into<String>) -> Self {
        Self {
            data_id,
            batch_id,
            router_id: router_id.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_link_action() -> NodeGroupLinkAction {
    NodeGroupLinkAction::WaitForPull
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_to_send() -> usize {
    60
}

fn default_max_data_to_route() -> usize {
    100_000
}

fn default_batch_algorithm() -> String {
    "default".to_string()
}

fn default_channel() -> String {
    CHANNEL_DEFAULT.to_string()
}

fn default_reload_channel() -> String {
    CHANNEL_RELOAD.to_string()
}

fn default_router_type() -> String {
    "default".to_string()
}

fn default_initial_load_order() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes() {
        for event in [
            DataEventType::Insert,
            DataEventType::Update,
            DataEventType::Delete,
            DataEventType::Reload,
            DataEventType::Sql,
            DataEventType::Create,
        ] {
            assert_eq!(DataEventType::from_code(event.code()), Some(event));
        }
        assert_eq!(DataEventType::from_code("X"), None);
        assert!(DataEventType::Delete.is_dml());
        assert!(!DataEventType::Reload.is_dml());
    }

    #[test]
    fn test_node_list_parsing() {
        let data = Data::new("item", DataEventType::Reload, 1, "reload").with_node_list("a, b,,c");
        assert_eq!(data.target_node_ids(), Some(vec!["a", "b", "c"]));

        let plain = Data::new("item", DataEventType::Insert, 1, "default");
        assert_eq!(plain.target_node_ids(), None);
    }

    #[test]
    fn test_trigger_history_hash_tracks_shape() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let pks = vec!["id".to_string()];
        let hist = TriggerHistory::new(1, "item", "item", columns.clone(), pks.clone());

        assert!(!hist.shape_differs(&columns, &pks));
        let altered = vec!["id".to_string(), "name".to_string(), "price".to_string()];
        assert!(hist.shape_differs(&altered, &pks));
        let reordered = vec!["name".to_string(), "id".to_string()];
        assert!(hist.shape_differs(&reordered, &pks));
    }

    #[test]
    fn test_trigger_history_pk_values() {
        let hist = TriggerHistory::new(
            1,
            "order_line",
            "order_line",
            vec!["qty".to_string(), "order_id".to_string(), "line".to_string()],
            vec!["order_id".to_string(), "line".to_string()],
        );
        let row = vec![Some("3".to_string()), Some("100".to_string()), Some("2".to_string())];
        assert_eq!(
            hist.pk_values(&row),
            vec![Some("100".to_string()), Some("2".to_string())]
        );
    }

    #[test]
    fn test_qualify_skips_missing_parts() {
        assert_eq!(qualify(None, None, "t"), "t");
        assert_eq!(qualify(None, Some("public"), "t"), "public.t");
        assert_eq!(qualify(Some("db"), Some(""), "t"), "db.t");
    }

    #[test]
    fn test_trigger_router_is_routed() {
        let mut trigger = Trigger::new("item", "item", "default");
        trigger.sync_on_delete = false;
        let router = Router::new("corp_2_store", "corp", "store");
        let tr = TriggerRouter::new(trigger, router);

        assert!(tr.is_routed(DataEventType::Insert));
        assert!(!tr.is_routed(DataEventType::Delete));
        assert!(tr.is_routed(DataEventType::Reload));
    }

    #[test]
    fn test_data_gap_identity_ignores_create_time() {
        let a = DataGap::created_at(1, 10, Utc::now());
        let b = DataGap::created_at(1, 10, Utc::now() - chrono::Duration::hours(1));
        assert_eq!(a, b);
        assert!(a.overlaps(&DataGap::new(10, 20)));
        assert!(!a.overlaps(&DataGap::new(11, 20)));
        assert!(a.contains(10));
        assert!(!a.contains(11));
        assert!(DataGap::new(1, 5) < DataGap::new(2, 3));
    }
}
