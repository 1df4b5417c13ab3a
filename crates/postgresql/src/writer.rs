//! [`PgDatabase`]: applies loaded batches to PostgreSQL tables.
//!
//! Row values arrive as text. Statements pass them as one JSON object and let
//! `json_populate_record` cast each value to its column type, so the writer
//! never has to look up column types itself.

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::Client;

use symmetric_sync_engine::{SyncTriggerControl, TargetDatabase, TargetTransaction};
use symmetric_sync_protocol::TableHeader;

use crate::client::{new_postgresql_client, sql_error};
use crate::schema::{SOURCE_NODE_SETTING, SYNC_DISABLED_SETTING};

/// Quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified_table(table: &TableHeader) -> String {
    let mut parts = Vec::new();
    if let Some(catalog) = table.catalog_name.as_deref().filter(|c| !c.is_empty()) {
        parts.push(quote_identifier(catalog));
    }
    if let Some(schema) = table.schema_name.as_deref().filter(|s| !s.is_empty()) {
        parts.push(quote_identifier(schema));
    }
    parts.push(quote_identifier(&table.table_name));
    parts.join(".")
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pair names with values. Missing trailing values become NULL.
fn record(columns: &[String], values: &[Option<String>]) -> JsonValue {
    let mut map = Map::new();
    for (i, column) in columns.iter().enumerate() {
        let value = values
            .get(i)
            .cloned()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null);
        map.insert(column.clone(), value);
    }
    JsonValue::Object(map)
}

fn key_columns(table: &TableHeader) -> &[String] {
    if table.pk_column_names.is_empty() {
        &table.column_names
    } else {
        &table.pk_column_names
    }
}

pub(crate) fn insert_statement(table: &TableHeader) -> String {
    let name = qualified_table(table);
    let columns = column_list(&table.column_names);
    format!(
        "INSERT INTO {name} ({columns})
         SELECT {columns} FROM json_populate_record(NULL::{name}, $1)
         ON CONFLICT DO NOTHING"
    )
}

pub(crate) fn update_statement(table: &TableHeader) -> String {
    let name = qualified_table(table);
    let columns = column_list(&table.column_names);
    let keys = column_list(key_columns(table));
    format!(
        "UPDATE {name} SET ({columns}) = (SELECT {columns} FROM json_populate_record(NULL::{name}, $1))
         WHERE ROW({keys}) IS NOT DISTINCT FROM (SELECT {keys} FROM json_populate_record(NULL::{name}, $2))"
    )
}

pub(crate) fn delete_statement(table: &TableHeader) -> String {
    let name = qualified_table(table);
    let keys = column_list(key_columns(table));
    format!(
        "DELETE FROM {name}
         WHERE ROW({keys}) IS NOT DISTINCT FROM (SELECT {keys} FROM json_populate_record(NULL::{name}, $1))"
    )
}

/// Target database reached through one shared client. A batch holds the
/// client for the length of its transaction.
#[derive(Clone)]
pub struct PgDatabase {
    client: Arc<Mutex<Client>>,
}

impl PgDatabase {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self { client }
    }

    pub async fn connect(connection_string: &str) -> Result<Self> {
        Ok(Self::new(new_postgresql_client(connection_string).await?))
    }
}

#[async_trait]
impl TargetDatabase for PgDatabase {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        let client = Arc::clone(&self.client).lock_owned().await;
        client.batch_execute("BEGIN").await.map_err(sql_error)?;
        Ok(Box::new(PgTransaction { client }))
    }
}

pub struct PgTransaction {
    client: OwnedMutexGuard<Client>,
}

impl PgTransaction {
    async fn execute(&self, sql: &str, params: &[&(dyn tokio_postgres::types::ToSql + Sync)]) -> Result<u64> {
        self.client.execute(sql, params).await.map_err(sql_error)
    }
}

#[async_trait]
impl SyncTriggerControl for PgTransaction {
    async fn disable_sync_triggers(&mut self, source_node_id: &str) -> Result<()> {
        self.client
            .execute(
                "SELECT set_config($1, '1', true), set_config($2, $3, true)",
                &[&SYNC_DISABLED_SETTING, &SOURCE_NODE_SETTING, &source_node_id],
            )
            .await
            .map_err(sql_error)?;
        Ok(())
    }

    async fn enable_sync_triggers(&mut self) -> Result<()> {
        self.client
            .execute(
                "SELECT set_config($1, '', true), set_config($2, '', true)",
                &[&SYNC_DISABLED_SETTING, &SOURCE_NODE_SETTING],
            )
            .await
            .map_err(sql_error)?;
        Ok(())
    }
}

#[async_trait]
impl TargetTransaction for PgTransaction {
    async fn insert(&mut self, table: &TableHeader, row: &[Option<String>]) -> Result<u64> {
        let values = record(&table.column_names, row);
        self.execute(&insert_statement(table), &[&values]).await
    }

    async fn update(
        &mut self,
        table: &TableHeader,
        row: &[Option<String>],
        pk: &[Option<String>],
    ) -> Result<u64> {
        let values = record(&table.column_names, row);
        let keys = record(key_columns(table), pk);
        self.execute(&update_statement(table), &[&values, &keys]).await
    }

    async fn delete(&mut self, table: &TableHeader, pk: &[Option<String>]) -> Result<u64> {
        let keys = record(key_columns(table), pk);
        self.execute(&delete_statement(table), &[&keys]).await
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<u64> {
        debug!("Executing replicated SQL: {sql}");
        self.client.batch_execute(sql).await.map_err(sql_error)?;
        Ok(0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("COMMIT").await.map_err(sql_error)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await.map_err(sql_error)?;
        Ok(())
    }
}
