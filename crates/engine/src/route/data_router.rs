//! Routing strategies that pick target nodes for one change row.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use sync_core::{Data, DataEventType, Node, SyncError, TriggerHistory, TriggerRouter};

use super::column_match::ColumnValues;
use super::context::ChannelRouterContext;

pub const ROUTER_TYPE_DEFAULT: &str = "default";
pub const ROUTER_TYPE_COLUMN: &str = "column";
pub const ROUTER_TYPE_SUBSELECT: &str = "subselect";
pub const ROUTER_TYPE_LOOKUP_TABLE: &str = "lookuptable";
pub const ROUTER_TYPE_CONFIGURATION_CHANGED: &str = "configurationChanged";

/// Prefix of the runtime configuration tables.
pub const TABLE_PREFIX: &str = "sym_";

/// Everything a router can look at for one row.
pub struct DataMetaData<'a> {
    pub data: &'a Data,
    pub history: &'a TriggerHistory,
    pub trigger_router: &'a TriggerRouter,
}

impl DataMetaData<'_> {
    /// Column values keyed by upper-case name, with old values under `OLD_`.
    pub fn column_values(&self) -> ColumnValues {
        let mut values = ColumnValues::new();
        let history = self.history;
        let new_values = match self.data.event_type {
            DataEventType::Delete => None,
            _ => self.data.row_data.as_ref(),
        };
        if let Some(row) = new_values {
            for (name, value) in history.column_names.iter().zip(row) {
                values.insert(name.to_uppercase(), value.clone());
            }
        }
        if let Some(old) = &self.data.old_data {
            for (name, value) in history.column_names.iter().zip(old) {
                let name = name.to_uppercase();
                if self.data.event_type == DataEventType::Delete {
                    values.insert(name.clone(), value.clone());
                }
                values.insert(format!("OLD_{name}"), value.clone());
            }
        } else if self.data.event_type == DataEventType::Delete {
            if let Some(pk) = &self.data.pk_data {
                for (name, value) in history.pk_column_names.iter().zip(pk) {
                    values.insert(name.to_uppercase(), value.clone());
                }
            }
        }
        values
    }

    /// Source table name without catalog, schema or the runtime table prefix.
    fn config_table_suffix(&self) -> Option<String> {
        let table = self.history.source_table_name.to_lowercase();
        table.strip_prefix(TABLE_PREFIX).map(str::to_string)
    }
}

/// Lookups that need the source database. Provided by the dialect.
#[async_trait]
pub trait RouterLookup: Send + Sync {
    /// Node ids chosen by a sub-select router expression for one row.
    async fn sub_select(
        &self,
        expression: &str,
        columns: &ColumnValues,
        nodes: &[Node],
    ) -> Result<Vec<String>>;

    /// Load a lookup table as key value to external ids.
    async fn lookup_table(
        &self,
        table: &str,
        key_column: &str,
        external_id_column: &str,
    ) -> Result<HashMap<String, Vec<String>>>;

    /// External id to node id redirects used by `:REDIRECT_NODE`.
    async fn redirect_map(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// In-process lookups over fixed tables.
#[derive(Debug, Clone, Default)]
pub struct StaticRouterLookup {
    sub_selects: HashMap<String, Vec<String>>,
    tables: HashMap<String, Vec<HashMap<String, String>>>,
    redirects: HashMap<String, String>,
}

impl StaticRouterLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sub_select(mut self, expression: &str, node_ids: &[&str]) -> Self {
        self.sub_selects.insert(
            expression.to_string(),
            node_ids.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Add a lookup table. Column names are matched case-insensitively.
    pub fn with_table(mut self, table: &str, rows: Vec<HashMap<String, String>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect())
            .collect();
        self.tables.insert(table.to_uppercase(), rows);
        self
    }

    pub fn with_redirect(mut self, external_id: &str, node_id: &str) -> Self {
        self.redirects
            .insert(external_id.to_string(), node_id.to_string());
        self
    }
}

#[async_trait]
impl RouterLookup for StaticRouterLookup {
    async fn sub_select(
        &self,
        expression: &str,
        _columns: &ColumnValues,
        _nodes: &[Node],
    ) -> Result<Vec<String>> {
        Ok(self.sub_selects.get(expression).cloned().unwrap_or_default())
    }

    async fn lookup_table(
        &self,
        table: &str,
        key_column: &str,
        external_id_column: &str,
    ) -> Result<HashMap<String, Vec<String>>> {
        let rows = self
            .tables
            .get(&table.to_uppercase())
            .ok_or_else(|| SyncError::Configuration(format!("Lookup table {table} does not exist")))?;
        let key_column = key_column.to_uppercase();
        let external_id_column = external_id_column.to_uppercase();
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            if let (Some(key), Some(external_id)) = (row.get(&key_column), row.get(&external_id_column)) {
                map.entry(key.clone()).or_default().push(external_id.clone());
            }
        }
        Ok(map)
    }

    async fn redirect_map(&self) -> Result<HashMap<String, String>> {
        Ok(self.redirects.clone())
    }
}

/// Owned view of a row handed to a scripted router.
#[derive(Debug, Clone)]
pub struct ScriptInput {
    pub data: Data,
    pub columns: ColumnValues,
    pub nodes: Vec<Node>,
}

/// A router implemented in code and registered under a router type name.
pub type ScriptedRouter =
    Arc<dyn Fn(ScriptInput) -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync>;

/// Routing strategy, chosen per router by its type name.
#[derive(Clone)]
pub enum DataRouter {
    Default,
    ColumnMatch,
    SubSelect,
    LookupTable,
    ConfigurationChanged,
    Scripted(String, ScriptedRouter),
}

impl std::fmt::Debug for DataRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataRouter::Scripted(name, _) => write!(f, "Scripted({name})"),
            other => f.write_str(other.name()),
        }
    }
}

impl DataRouter {
    /// Resolve a router type. Built-in names win over scripted ones.
    pub fn resolve(router_type: &str, scripts: &HashMap<String, ScriptedRouter>) -> Option<Self> {
        match router_type {
            ROUTER_TYPE_DEFAULT | "" => Some(DataRouter::Default),
            ROUTER_TYPE_COLUMN => Some(DataRouter::ColumnMatch),
            ROUTER_TYPE_SUBSELECT => Some(DataRouter::SubSelect),
            ROUTER_TYPE_LOOKUP_TABLE => Some(DataRouter::LookupTable),
            ROUTER_TYPE_CONFIGURATION_CHANGED => Some(DataRouter::ConfigurationChanged),
            other => scripts
                .get(other)
                .map(|script| DataRouter::Scripted(other.to_string(), Arc::clone(script))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DataRouter::Default => ROUTER_TYPE_DEFAULT,
            DataRouter::ColumnMatch => ROUTER_TYPE_COLUMN,
            DataRouter::SubSelect => ROUTER_TYPE_SUBSELECT,
            DataRouter::LookupTable => ROUTER_TYPE_LOOKUP_TABLE,
            DataRouter::ConfigurationChanged => ROUTER_TYPE_CONFIGURATION_CHANGED,
            DataRouter::Scripted(name, _) => name,
        }
    }

    /// Ids of the nodes among `nodes` that should receive the row.
    pub async fn route_to_nodes(
        &self,
        meta: &DataMetaData<'_>,
        nodes: &[Node],
        context: &mut ChannelRouterContext,
        lookup: &dyn RouterLookup,
    ) -> Result<BTreeSet<String>> {
        let router = &meta.trigger_router.router;
        match self {
            DataRouter::Default => Ok(all_node_ids(nodes)),
            DataRouter::ColumnMatch => {
                let expression = router.router_expression.as_deref().unwrap_or_default();
                let parsed = context.column_expression(&router.router_id, expression)?;
                let redirects = match context.redirects() {
                    Some(redirects) => redirects,
                    None => context.cache_redirects(lookup.redirect_map().await?),
                };
                Ok(parsed.route(
                    &meta.column_values(),
                    nodes,
                    meta.data.external_data.as_deref(),
                    &redirects,
                ))
            }
            DataRouter::SubSelect => {
                let expression = router.router_expression.as_deref().unwrap_or_default();
                let selected = lookup
                    .sub_select(expression, &meta.column_values(), nodes)
                    .await?;
                Ok(restrict_to(nodes, selected))
            }
            DataRouter::LookupTable => {
                let settings = LookupTableSettings::parse(
                    &router.router_id,
                    router.router_expression.as_deref().unwrap_or_default(),
                )?;
                let table = match context.lookup_table(&router.router_id) {
                    Some(table) => table,
                    None => {
                        let table = lookup
                            .lookup_table(
                                &settings.lookup_table,
                                &settings.lookup_key_column,
                                &settings.external_id_column,
                            )
                            .await?;
                        context.cache_lookup_table(&router.router_id, table)
                    }
                };
                let columns = meta.column_values();
                let key = columns
                    .get(&settings.key_column.to_uppercase())
                    .cloned()
                    .flatten();
                let external_ids = key.and_then(|k| table.get(&k)).cloned().unwrap_or_default();
                Ok(nodes
                    .iter()
                    .filter(|n| external_ids.contains(&n.external_id))
                    .map(|n| n.node_id.clone())
                    .collect())
            }
            DataRouter::ConfigurationChanged => Ok(route_configuration_change(meta, nodes, context)),
            DataRouter::Scripted(_, script) => {
                let input = ScriptInput {
                    data: meta.data.clone(),
                    columns: meta.column_values(),
                    nodes: nodes.to_vec(),
                };
                let selected = script(input).await?;
                Ok(restrict_to(nodes, selected))
            }
        }
    }
}

fn all_node_ids(nodes: &[Node]) -> BTreeSet<String> {
    nodes.iter().map(|n| n.node_id.clone()).collect()
}

fn restrict_to(nodes: &[Node], selected: Vec<String>) -> BTreeSet<String> {
    selected
        .into_iter()
        .filter(|id| nodes.iter().any(|n| &n.node_id == id))
        .collect()
}

/// Parsed `KEY=VALUE` lines of a lookup-table router expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTableSettings {
    pub lookup_table: String,
    pub key_column: String,
    pub lookup_key_column: String,
    pub external_id_column: String,
}

impl LookupTableSettings {
    pub fn parse(router_id: &str, expression: &str) -> Result<Self, SyncError> {
        let entries: HashMap<String, String> = expression
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_uppercase(), v.trim().to_string()))
            .collect();
        let get = |key: &str| {
            entries
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| SyncError::RouterSyntax {
                    router_id: router_id.to_string(),
                    message: format!("The lookup table router expression is missing {key}"),
                })
        };
        Ok(Self {
            lookup_table: get("LOOKUP_TABLE")?,
            key_column: get("KEY_COLUMN")?,
            lookup_key_column: get("LOOKUP_KEY_COLUMN")?,
            external_id_column: get("EXTERNAL_ID_COLUMN")?,
        })
    }
}

fn route_configuration_change(
    meta: &DataMetaData<'_>,
    nodes: &[Node],
    context: &mut ChannelRouterContext,
) -> BTreeSet<String> {
    let Some(table) = meta.config_table_suffix() else {
        return all_node_ids(nodes);
    };
    match table.as_str() {
        "channel" | "node_channel_ctl" => context.config_changes.channels = true,
        "trigger_router" | "router" | "trigger" => context.config_changes.trigger_routers = true,
        "node" | "node_group_link" => context.config_changes.nodes = true,
        _ => {}
    }

    let columns = meta.column_values();
    let column = |name: &str| columns.get(name).cloned().flatten();
    match table.as_str() {
        "node" | "node_security" | "node_host" => match column("NODE_ID") {
            Some(node_id) => restrict_to(nodes, vec![node_id]),
            None => BTreeSet::new(),
        },
        "table_reload_request" => restrict_to(
            nodes,
            [column("SOURCE_NODE_ID"), column("TARGET_NODE_ID")]
                .into_iter()
                .flatten()
                .collect(),
        ),
        _ => all_node_ids(nodes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use sync_core::{Channel, MemoryStore, NodeChannel, Router, Trigger};

    fn history(table: &str, columns: &[&str]) -> TriggerHistory {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let pk = vec![columns[0].clone()];
        TriggerHistory::new(1, "t1", table, columns, pk)
    }

    fn trigger_router(table: &str, router_type: &str, expression: Option<&str>) -> TriggerRouter {
        TriggerRouter::new(
            Trigger::new("t1", table, "default"),
            Router::new("r1", "corp", "store").with_type(router_type, expression),
        )
    }

    fn nodes() -> Vec<Node> {
        vec![Node::new("001", "store", "s1"), Node::new("002", "store", "s2")]
    }

    fn context() -> ChannelRouterContext {
        let channel = NodeChannel::new("000", Channel::new("default", 1));
        ChannelRouterContext::new(Arc::new(MemoryStore::new()), channel, 100)
    }

    fn row(values: &[&str]) -> Data {
        Data::new("item", DataEventType::Insert, 1, "default")
            .with_row_data(values.iter().map(|v| Some(v.to_string())).collect())
    }

    async fn route(router: &DataRouter, meta: &DataMetaData<'_>, lookup: &dyn RouterLookup) -> Vec<String> {
        let mut ctx = context();
        router
            .route_to_nodes(meta, &nodes(), &mut ctx, lookup)
            .await
            .unwrap()
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_default_and_column_routers() {
        let hist = history("item", &["id", "store"]);
        let data = row(&["1", "s2"]);
        let tr = trigger_router("item", "column", Some("STORE=:EXTERNAL_ID"));
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        let lookup = StaticRouterLookup::new();

        assert_eq!(route(&DataRouter::Default, &meta, &lookup).await, vec!["001", "002"]);
        assert_eq!(route(&DataRouter::ColumnMatch, &meta, &lookup).await, vec!["002"]);
    }

    #[tokio::test]
    async fn test_lookup_table_router() {
        let hist = history("item", &["id", "region"]);
        let data = row(&["1", "north"]);
        let tr = trigger_router(
            "item",
            "lookuptable",
            Some("LOOKUP_TABLE=region_store\nKEY_COLUMN=REGION\nLOOKUP_KEY_COLUMN=region_id\nEXTERNAL_ID_COLUMN=store_id"),
        );
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        let table_row = |region: &str, store: &str| -> HashMap<String, String> {
            [("region_id".to_string(), region.to_string()), ("store_id".to_string(), store.to_string())]
                .into_iter()
                .collect()
        };
        let lookup = StaticRouterLookup::new()
            .with_table("region_store", vec![table_row("north", "s1"), table_row("south", "s2")]);

        assert_eq!(route(&DataRouter::LookupTable, &meta, &lookup).await, vec!["001"]);
    }

    #[tokio::test]
    async fn test_lookup_table_expression_requires_all_keys() {
        let err = LookupTableSettings::parse("r1", "LOOKUP_TABLE=x\nKEY_COLUMN=y").unwrap_err();
        assert!(err.to_string().contains("LOOKUP_KEY_COLUMN"));
    }

    #[tokio::test]
    async fn test_sub_select_is_restricted_to_available_nodes() {
        let hist = history("item", &["id"]);
        let data = row(&["1"]);
        let tr = trigger_router("item", "subselect", Some("select node_id from x"));
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        let lookup = StaticRouterLookup::new().with_sub_select("select node_id from x", &["002", "999"]);
        assert_eq!(route(&DataRouter::SubSelect, &meta, &lookup).await, vec!["002"]);
    }

    #[tokio::test]
    async fn test_configuration_changed_router() {
        let hist = history("sym_node", &["node_id", "node_group_id"]);
        let data = row(&["002", "store"]);
        let tr = trigger_router("sym_node", "configurationChanged", None);
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        let mut ctx = context();
        let routed = DataRouter::ConfigurationChanged
            .route_to_nodes(&meta, &nodes(), &mut ctx, &StaticRouterLookup::new())
            .await
            .unwrap();
        assert_eq!(routed.into_iter().collect::<Vec<_>>(), vec!["002"]);
        assert!(ctx.config_changes.nodes);
        assert!(!ctx.config_changes.channels);

        let hist = history("sym_channel", &["channel_id"]);
        let data = row(&["default"]);
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        let routed = DataRouter::ConfigurationChanged
            .route_to_nodes(&meta, &nodes(), &mut ctx, &StaticRouterLookup::new())
            .await
            .unwrap();
        assert_eq!(routed.len(), 2);
        assert!(ctx.config_changes.channels);
    }

    #[tokio::test]
    async fn test_scripted_router_resolution() {
        let script: ScriptedRouter = Arc::new(|input: ScriptInput| {
            async move {
                let selected: Vec<String> = input
                    .nodes
                    .iter()
                    .filter(|n| n.external_id == "s1")
                    .map(|n| n.node_id.clone())
                    .collect();
                Ok::<_, anyhow::Error>(selected)
            }
            .boxed()
        });
        let scripts: HashMap<String, ScriptedRouter> = [("even".to_string(), script)].into_iter().collect();
        let router = DataRouter::resolve("even", &scripts).unwrap();
        assert_eq!(router.name(), "even");
        assert!(DataRouter::resolve("bogus", &scripts).is_none());
        assert!(matches!(DataRouter::resolve("", &scripts), Some(DataRouter::Default)));

        let hist = history("item", &["id"]);
        let data = row(&["1"]);
        let tr = trigger_router("item", "even", None);
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        assert_eq!(route(&router, &meta, &StaticRouterLookup::new()).await, vec!["001"]);
    }

    #[test]
    fn test_delete_uses_old_values() {
        let hist = history("item", &["id", "store"]);
        let data = Data::new("item", DataEventType::Delete, 1, "default")
            .with_old_data(vec![Some("1".into()), Some("s1".into())])
            .with_pk_data(vec![Some("1".into())]);
        let tr = trigger_router("item", "default", None);
        let meta = DataMetaData { data: &data, history: &hist, trigger_router: &tr };
        let values = meta.column_values();
        assert_eq!(values.get("STORE").cloned().flatten().as_deref(), Some("s1"));
        assert_eq!(values.get("OLD_STORE").cloned().flatten().as_deref(), Some("s1"));
    }
}
