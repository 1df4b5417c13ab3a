//! Applying change records to the target database.
//!
//! [`TargetDatabase`] abstracts the database the loader writes to. A load
//! opens one [`TargetTransaction`] per batch and drives it through a
//! [`DatabaseWriter`], which turns each [`CsvData`] record into insert,
//! update or delete statements and resolves conflicts according to
//! [`ConflictSettings`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use symmetric_sync_protocol::{CsvData, TableHeader};
use sync_core::{DataEventType, RowValues, SqlError, SyncError};

/// What to do when a delete finds no row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDeletePolicy {
    #[default]
    Ignore,
    Stop,
}

/// What to do when an insert hits an existing row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingInsertPolicy {
    #[default]
    FallbackUpdate,
    Stop,
}

/// What to do when an update finds no row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingUpdatePolicy {
    #[default]
    FallbackInsert,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictSettings {
    pub missing_delete: MissingDeletePolicy,
    pub existing_insert: ExistingInsertPolicy,
    pub missing_update: MissingUpdatePolicy,
}

/// Turns change capture off for the session applying a batch, so loaded rows
/// are not captured again as local changes.
#[async_trait]
pub trait SyncTriggerControl: Send {
    async fn disable_sync_triggers(&mut self, source_node_id: &str) -> Result<()>;
    async fn enable_sync_triggers(&mut self) -> Result<()>;
}

/// One database transaction on the target.
///
/// Each write returns the number of affected rows. An insert of a row whose
/// key already exists returns 0 rather than failing.
#[async_trait]
pub trait TargetTransaction: SyncTriggerControl {
    async fn insert(&mut self, table: &TableHeader, row: &[Option<String>]) -> Result<u64>;
    async fn update(
        &mut self,
        table: &TableHeader,
        row: &[Option<String>],
        pk: &[Option<String>],
    ) -> Result<u64>;
    async fn delete(&mut self, table: &TableHeader, pk: &[Option<String>]) -> Result<u64>;
    async fn execute_sql(&mut self, sql: &str) -> Result<u64>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait TargetDatabase: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>>;
}

/// Counters collected while applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatistics {
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
    pub ignore_count: i64,
    pub database_millis: i64,
}

/// Applies the records of one batch inside one transaction.
pub struct DatabaseWriter {
    transaction: Box<dyn TargetTransaction>,
    conflict: ConflictSettings,
    table: Option<TableHeader>,
    stats: WriterStatistics,
}

impl DatabaseWriter {
    /// Begin a transaction and disable change capture for it.
    pub async fn open(
        database: &dyn TargetDatabase,
        conflict: ConflictSettings,
        source_node_id: &str,
    ) -> Result<Self> {
        let mut transaction = database.begin().await?;
        if let Err(e) = transaction.disable_sync_triggers(source_node_id).await {
            let _ = transaction.rollback().await;
            return Err(e);
        }
        Ok(Self {
            transaction,
            conflict,
            table: None,
            stats: WriterStatistics::default(),
        })
    }

    pub fn start_table(&mut self, table: TableHeader) {
        self.table = Some(table);
    }

    pub fn table(&self) -> Option<&TableHeader> {
        self.table.as_ref()
    }

    pub fn statistics(&self) -> WriterStatistics {
        self.stats
    }

    pub async fn write(&mut self, data: &CsvData) -> Result<()> {
        let started = Instant::now();
        let result = self.apply(data).await;
        self.stats.database_millis += started.elapsed().as_millis() as i64;
        if result.is_ok() {
            self.stats.statement_count += 1;
        }
        result
    }

    async fn apply(&mut self, data: &CsvData) -> Result<()> {
        if data.event_type == DataEventType::Sql {
            let statement = data
                .row_data
                .as_ref()
                .and_then(|row| row.first().cloned().flatten())
                .unwrap_or_default();
            self.transaction.execute_sql(&statement).await?;
            return Ok(());
        }

        let table = self.table.as_ref().ok_or_else(|| SyncError::Protocol {
            line: data.line_number,
            message: "Row data arrived before a table header".to_string(),
        })?;

        match data.event_type {
            DataEventType::Insert => {
                let row = required(&data.row_data, data)?;
                if self.transaction.insert(table, row).await? > 0 {
                    return Ok(());
                }
                match self.conflict.existing_insert {
                    ExistingInsertPolicy::FallbackUpdate => {
                        let pk = pk_of(table, row);
                        if self.transaction.update(table, row, &pk).await? == 0 {
                            return Err(conflict(table, data, "the row exists but could not be updated"));
                        }
                        self.stats.fallback_update_count += 1;
                        Ok(())
                    }
                    ExistingInsertPolicy::Stop => {
                        Err(conflict(table, data, "a row with the same key already exists"))
                    }
                }
            }
            DataEventType::Update => {
                let row = required(&data.row_data, data)?;
                let pk = match &data.pk_data {
                    Some(pk) => pk.clone(),
                    None => pk_of(table, row),
                };
                if self.transaction.update(table, row, &pk).await? > 0 {
                    return Ok(());
                }
                match self.conflict.missing_update {
                    MissingUpdatePolicy::FallbackInsert => {
                        if self.transaction.insert(table, row).await? == 0 {
                            return Err(conflict(table, data, "the row could not be inserted"));
                        }
                        self.stats.fallback_insert_count += 1;
                        Ok(())
                    }
                    MissingUpdatePolicy::Stop => Err(conflict(table, data, "no row matched the key")),
                }
            }
            DataEventType::Delete => {
                let pk = required(&data.pk_data, data)?;
                if self.transaction.delete(table, pk).await? > 0 {
                    return Ok(());
                }
                match self.conflict.missing_delete {
                    MissingDeletePolicy::Ignore => {
                        self.stats.missing_delete_count += 1;
                        Ok(())
                    }
                    MissingDeletePolicy::Stop => Err(conflict(table, data, "no row matched the key")),
                }
            }
            other => {
                tracing::warn!(
                    "Ignoring {} event on {} at line {}",
                    other,
                    table.fully_qualified_name(),
                    data.line_number
                );
                self.stats.ignore_count += 1;
                Ok(())
            }
        }
    }

    /// Re-enable change capture and commit.
    pub async fn commit(mut self) -> Result<WriterStatistics> {
        if let Err(e) = self.transaction.enable_sync_triggers().await {
            let _ = self.transaction.rollback().await;
            return Err(e);
        }
        self.transaction.commit().await?;
        Ok(self.stats)
    }

    /// Re-enable change capture and roll back, logging rather than returning failures.
    pub async fn rollback(mut self) {
        if let Err(e) = self.transaction.enable_sync_triggers().await {
            tracing::warn!("Failed to re-enable sync triggers: {:#}", e);
        }
        if let Err(e) = self.transaction.rollback().await {
            tracing::warn!("Failed to roll back the load transaction: {:#}", e);
        }
    }
}

fn required<'a>(values: &'a Option<RowValues>, data: &CsvData) -> Result<&'a RowValues, SyncError> {
    values.as_ref().ok_or_else(|| SyncError::Protocol {
        line: data.line_number,
        message: format!("The {} record has no values", data.event_type),
    })
}

fn pk_of(table: &TableHeader, row: &[Option<String>]) -> RowValues {
    table
        .pk_indexes()
        .into_iter()
        .map(|i| row.get(i).cloned().flatten())
        .collect()
}

fn conflict(table: &TableHeader, data: &CsvData, detail: &str) -> anyhow::Error {
    SyncError::Conflict {
        table: table.fully_qualified_name(),
        event_type: data.event_type.to_string(),
        detail: detail.to_string(),
    }
    .into()
}

type MemoryRow = BTreeMap<String, Option<String>>;
type MemoryTable = BTreeMap<Vec<Option<String>>, MemoryRow>;

#[derive(Debug, Default)]
struct MemoryDatabaseState {
    tables: HashMap<String, MemoryTable>,
    statements: Vec<String>,
    failing_tables: HashSet<String>,
    trigger_toggles: usize,
}

/// In-process target database. Tables are created on first write and rows
/// are keyed by their primary key values.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryDatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `table` fail with a SQL error.
    pub async fn fail_writes_to(&self, table: &str) {
        self.state
            .lock()
            .await
            .failing_tables
            .insert(table.to_lowercase());
    }

    /// Rows of a table, in key order.
    pub async fn rows(&self, table: &str) -> Vec<MemoryRow> {
        self.state
            .lock()
            .await
            .tables
            .get(&table.to_lowercase())
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.rows(table).await.len()
    }

    pub async fn statements(&self) -> Vec<String> {
        self.state.lock().await.statements.clone()
    }

    /// How many times change capture was turned off and back on.
    pub async fn trigger_toggles(&self) -> usize {
        self.state.lock().await.trigger_toggles
    }
}

#[async_trait]
impl TargetDatabase for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        let state = self.state.lock().await;
        Ok(Box::new(MemoryTransaction {
            database: self.clone(),
            tables: state.tables.clone(),
            statements: Vec::new(),
            failing_tables: state.failing_tables.clone(),
            sync_disabled: false,
            toggles: 0,
        }))
    }
}

struct MemoryTransaction {
    database: MemoryDatabase,
    tables: HashMap<String, MemoryTable>,
    statements: Vec<String>,
    failing_tables: HashSet<String>,
    sync_disabled: bool,
    toggles: usize,
}

impl MemoryTransaction {
    fn table_mut(&mut self, table: &TableHeader) -> Result<&mut MemoryTable> {
        let name = table.fully_qualified_name().to_lowercase();
        if self.failing_tables.contains(&name) {
            return Err(SyncError::Sql(SqlError::new(
                Some("42000".to_string()),
                -1,
                format!("Writes to {name} are failing"),
            ))
            .into());
        }
        Ok(self.tables.entry(name).or_default())
    }
}

fn memory_row(table: &TableHeader, row: &[Option<String>]) -> MemoryRow {
    table
        .column_names
        .iter()
        .zip(row.iter())
        .map(|(name, value)| (name.to_lowercase(), value.clone()))
        .collect()
}

#[async_trait]
impl SyncTriggerControl for MemoryTransaction {
    async fn disable_sync_triggers(&mut self, _source_node_id: &str) -> Result<()> {
        self.sync_disabled = true;
        Ok(())
    }

    async fn enable_sync_triggers(&mut self) -> Result<()> {
        if self.sync_disabled {
            self.sync_disabled = false;
            self.toggles += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl TargetTransaction for MemoryTransaction {
    async fn insert(&mut self, table: &TableHeader, row: &[Option<String>]) -> Result<u64> {
        let key = pk_of(table, row);
        let values = memory_row(table, row);
        let rows = self.table_mut(table)?;
        if rows.contains_key(&key) {
            return Ok(0);
        }
        rows.insert(key, values);
        Ok(1)
    }

    async fn update(
        &mut self,
        table: &TableHeader,
        row: &[Option<String>],
        pk: &[Option<String>],
    ) -> Result<u64> {
        let new_key = pk_of(table, row);
        let values = memory_row(table, row);
        let rows = self.table_mut(table)?;
        if rows.remove(pk).is_none() {
            return Ok(0);
        }
        rows.insert(new_key, values);
        Ok(1)
    }

    async fn delete(&mut self, table: &TableHeader, pk: &[Option<String>]) -> Result<u64> {
        Ok(self.table_mut(table)?.remove(pk).map_or(0, |_| 1))
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<u64> {
        self.statements.push(sql.to_string());
        Ok(0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.database.state.lock().await;
        state.tables = self.tables;
        state.statements.extend(self.statements);
        state.trigger_toggles += self.toggles;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.database.state.lock().await.trigger_toggles += self.toggles;
        Ok(())
    }
}
