//! Streaming payload writer.

use std::io::Write;

use sync_core::row::{encode_line, encode_names_line};
use sync_core::{DataEventType, SyncError};

use crate::{
    BatchHeader, CsvData, TableHeader, BATCH, BINARY, CATALOG, CHANNEL, COLUMNS, COMMIT, CREATE,
    DELETE, IGNORE, INSERT, KEYS, NODEID, OLD, SCHEMA, SQL, TABLE, UPDATE,
};

/// Writes batches to any [`Write`] sink, counting the bytes it produces.
pub struct ProtocolWriter<W: Write> {
    out: W,
    bytes_written: u64,
    last_node_id: Option<String>,
    last_table: Option<TableHeader>,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            bytes_written: 0,
            last_node_id: None,
            last_table: None,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn start_batch(&mut self, header: &BatchHeader) -> Result<(), SyncError> {
        if self.last_node_id.as_deref() != Some(header.source_node_id.as_str()) {
            self.line(&encode_names_line(NODEID, &[&header.source_node_id]))?;
            self.line(&encode_names_line(BINARY, &[header.binary_encoding.as_str()]))?;
            self.last_node_id = Some(header.source_node_id.clone());
        }
        self.line(&encode_names_line(CHANNEL, &[&header.channel_id]))?;
        if header.ignored {
            self.line(IGNORE)?;
        }
        self.line(&format!("{BATCH},{}", header.batch_id))?;
        self.last_table = None;
        Ok(())
    }

    /// Write a table header unless it matches the one already in effect for this batch.
    pub fn write_table(&mut self, table: &TableHeader) -> Result<(), SyncError> {
        if self.last_table.as_ref() == Some(table) {
            return Ok(());
        }
        let previous = self.last_table.take();
        let catalog_changed = previous.as_ref().map(|t| &t.catalog_name) != Some(&table.catalog_name);
        let schema_changed = previous.as_ref().map(|t| &t.schema_name) != Some(&table.schema_name);
        if catalog_changed {
            self.line(&encode_line(CATALOG, &[table.catalog_name.clone()]))?;
        }
        if schema_changed {
            self.line(&encode_line(SCHEMA, &[table.schema_name.clone()]))?;
        }
        self.line(&encode_names_line(TABLE, &[&table.table_name]))?;
        self.line(&encode_names_line(KEYS, &table.pk_column_names))?;
        self.line(&encode_names_line(COLUMNS, &table.column_names))?;
        self.last_table = Some(table.clone());
        Ok(())
    }

    pub fn write_data(&mut self, data: &CsvData) -> Result<(), SyncError> {
        let empty = Vec::new();
        match data.event_type {
            DataEventType::Insert => {
                let row = data.row_data.as_ref().unwrap_or(&empty);
                self.line(&encode_line(INSERT, row))
            }
            DataEventType::Update => {
                if let Some(old) = &data.old_data {
                    self.line(&encode_line(OLD, old))?;
                }
                let mut values = data.row_data.clone().unwrap_or_default();
                values.extend(data.pk_data.clone().unwrap_or_default());
                self.line(&encode_line(UPDATE, &values))
            }
            DataEventType::Delete => {
                if let Some(old) = &data.old_data {
                    self.line(&encode_line(OLD, old))?;
                }
                let pk = data.pk_data.as_ref().unwrap_or(&empty);
                self.line(&encode_line(DELETE, pk))
            }
            DataEventType::Sql => self.line(&encode_line(SQL, &first_value(data))),
            DataEventType::Create => self.line(&encode_line(CREATE, &first_value(data))),
            DataEventType::Reload => Err(SyncError::Protocol {
                line: 0,
                message: "reload events must be expanded before they are written".to_string(),
            }),
        }
    }

    pub fn end_batch(&mut self, batch_id: i64) -> Result<(), SyncError> {
        self.line(&format!("{COMMIT},{batch_id}"))?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, line: &str) -> Result<(), SyncError> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.bytes_written += line.len() as u64 + 1;
        Ok(())
    }
}

fn first_value(data: &CsvData) -> Vec<Option<String>> {
    data.row_data
        .as_ref()
        .and_then(|row| row.first().cloned())
        .into_iter()
        .collect()
}
