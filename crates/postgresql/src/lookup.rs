//! Source-side queries the engine delegates to the database: initial load
//! selects and the sub-select and lookup-table routers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use symmetric_sync_engine::route::ColumnValues;
use symmetric_sync_engine::{InitialLoadSource, RouterLookup};
use sync_core::{Node, RowValues, TriggerHistory};

use crate::writer::quote_identifier;

fn qualified_source_table(history: &TriggerHistory) -> String {
    let mut parts = Vec::new();
    if let Some(catalog) = history.source_catalog_name.as_deref().filter(|c| !c.is_empty()) {
        parts.push(quote_identifier(catalog));
    }
    if let Some(schema) = history.source_schema_name.as_deref().filter(|s| !s.is_empty()) {
        parts.push(quote_identifier(schema));
    }
    parts.push(quote_identifier(&history.source_table_name));
    parts.join(".")
}

pub(crate) fn initial_load_query(history: &TriggerHistory, where_clause: Option<&str>) -> String {
    let columns: Vec<String> = history
        .column_names
        .iter()
        .map(|c| format!("{}::text", quote_identifier(c)))
        .collect();
    let order: Vec<String> = history.pk_column_names.iter().map(|c| quote_identifier(c)).collect();
    let mut sql = format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        qualified_source_table(history)
    );
    if let Some(clause) = where_clause.map(str::trim).filter(|c| !c.is_empty()) {
        sql.push_str(&format!(" WHERE {clause}"));
    }
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    sql
}

/// Reads whole tables for reloads.
pub struct PgInitialLoadSource {
    client: Arc<Mutex<Client>>,
}

impl PgInitialLoadSource {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InitialLoadSource for PgInitialLoadSource {
    async fn select_rows(
        &self,
        history: &TriggerHistory,
        where_clause: Option<&str>,
    ) -> Result<Vec<RowValues>> {
        let sql = initial_load_query(history, where_clause);
        let client = self.client.lock().await;
        let rows = client
            .query(&sql, &[])
            .await
            .with_context(|| format!("Initial load select failed: {sql}"))?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| Ok(row.try_get::<_, Option<String>>(i)?))
                    .collect::<Result<RowValues>>()
            })
            .collect()
    }
}

/// Quote a value as an SQL string literal.
fn literal(value: Option<&str>) -> String {
    match value {
        Some(v) => format!("'{}'", v.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Replace `:COLUMN` tokens with the row's values as literals. Longer names
/// are replaced first so `:ID` does not clobber `:ID_TYPE`.
pub(crate) fn bind_columns(expression: &str, columns: &ColumnValues) -> String {
    let mut names: Vec<&String> = columns.keys().collect();
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));
    let mut sql = expression.to_string();
    for name in names {
        let token = format!(":{name}");
        if sql.contains(&token) {
            let value = columns.get(name).and_then(|v| v.as_deref());
            sql = sql.replace(&token, &literal(value));
        }
    }
    sql
}

/// Runs router sub-selects and lookup tables against the source database.
///
/// Sub-select expressions are a condition over the node table aliased as
/// `c`, for example `c.external_id = :STORE_ID`.
pub struct PgRouterLookup {
    client: Arc<Mutex<Client>>,
}

impl PgRouterLookup {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouterLookup for PgRouterLookup {
    async fn sub_select(
        &self,
        expression: &str,
        columns: &ColumnValues,
        nodes: &[Node],
    ) -> Result<Vec<String>> {
        let candidates: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        let sql = format!(
            "SELECT c.node_id FROM (
                 SELECT doc->>'node_id' AS node_id, doc->>'node_group_id' AS node_group_id,
                        doc->>'external_id' AS external_id
                 FROM sym_node
             ) c
             WHERE c.node_id = ANY($1) AND ({})",
            bind_columns(expression, columns)
        );
        let client = self.client.lock().await;
        let rows = client
            .query(&sql, &[&candidates])
            .await
            .with_context(|| format!("Router sub-select failed: {sql}"))?;
        rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
    }

    async fn lookup_table(
        &self,
        table: &str,
        key_column: &str,
        external_id_column: &str,
    ) -> Result<HashMap<String, Vec<String>>> {
        let sql = format!(
            "SELECT {}::text, {}::text FROM {}",
            quote_identifier(&key_column.to_lowercase()),
            quote_identifier(&external_id_column.to_lowercase()),
            quote_identifier(&table.to_lowercase())
        );
        let client = self.client.lock().await;
        let rows = client
            .query(&sql, &[])
            .await
            .with_context(|| format!("Failed to read lookup table {table}"))?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let key: Option<String> = row.try_get(0)?;
            let external_id: Option<String> = row.try_get(1)?;
            if let (Some(key), Some(external_id)) = (key, external_id) {
                map.entry(key).or_default().push(external_id);
            }
        }
        Ok(map)
    }
}
