//! Batch payload format for symmetric-sync.
//!
//! A payload is a stream of lines. Each batch opens with a header
//! (`nodeid`, `binary`, `channel`, `batch`), each table with a table header
//! (`catalog`, `schema`, `table`, `keys`, `columns`), followed by one record
//! per change row (`insert`, `old`, `update`, `delete`, `sql`, `create`) and a
//! closing `commit`.
//!
//! ```text
//! nodeid,corp-000
//! binary,NONE
//! channel,default
//! batch,17
//! table,item
//! keys,id
//! columns,id,name
//! insert,"1","apple"
//! old,"1","apple"
//! update,"1","pear","1"
//! delete,"1"
//! commit,17
//! ```
//!
//! Both [`ProtocolWriter`] and [`ProtocolReader`] work in a single pass.

mod reader;
mod writer;

pub use reader::{ProtocolEvent, ProtocolReader};
pub use writer::ProtocolWriter;

use sync_core::{qualify, DataEventType, RowValues};

pub const NODEID: &str = "nodeid";
pub const BINARY: &str = "binary";
pub const CHANNEL: &str = "channel";
pub const BATCH: &str = "batch";
pub const CATALOG: &str = "catalog";
pub const SCHEMA: &str = "schema";
pub const TABLE: &str = "table";
pub const KEYS: &str = "keys";
pub const COLUMNS: &str = "columns";
pub const INSERT: &str = "insert";
pub const OLD: &str = "old";
pub const UPDATE: &str = "update";
pub const DELETE: &str = "delete";
pub const SQL: &str = "sql";
pub const CREATE: &str = "create";
pub const IGNORE: &str = "ignore";
pub const COMMIT: &str = "commit";

/// How binary column values are encoded in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryEncoding {
    #[default]
    None,
    Base64,
    Hex,
}

impl BinaryEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryEncoding::None => "NONE",
            BinaryEncoding::Base64 => "BASE64",
            BinaryEncoding::Hex => "HEX",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "NONE" => Some(BinaryEncoding::None),
            "BASE64" => Some(BinaryEncoding::Base64),
            "HEX" => Some(BinaryEncoding::Hex),
            _ => None,
        }
    }
}

/// Per-batch header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub batch_id: i64,
    /// Node that produced the batch.
    pub source_node_id: String,
    pub channel_id: String,
    pub binary_encoding: BinaryEncoding,
    /// The target acknowledges the batch without applying it. Written before the `batch` line.
    pub ignored: bool,
}

impl BatchHeader {
    pub fn new(
        batch_id: i64,
        source_node_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            source_node_id: source_node_id.into(),
            channel_id: channel_id.into(),
            binary_encoding: BinaryEncoding::None,
            ignored: false,
        }
    }
}

/// Per-table header: target identity plus the column layout of the rows that follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    pub catalog_name: Option<String>,
    pub schema_name: Option<String>,
    pub table_name: String,
    pub column_names: Vec<String>,
    pub pk_column_names: Vec<String>,
}

impl TableHeader {
    pub fn new(
        table_name: impl Into<String>,
        column_names: Vec<String>,
        pk_column_names: Vec<String>,
    ) -> Self {
        Self {
            catalog_name: None,
            schema_name: None,
            table_name: table_name.into(),
            column_names,
            pk_column_names,
        }
    }

    pub fn fully_qualified_name(&self) -> String {
        qualify(
            self.catalog_name.as_deref(),
            self.schema_name.as_deref(),
            &self.table_name,
        )
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Positions of the key columns within `column_names`.
    pub fn pk_indexes(&self) -> Vec<usize> {
        self.pk_column_names
            .iter()
            .filter_map(|pk| self.column_index(pk))
            .collect()
    }
}

/// One change record inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvData {
    pub event_type: DataEventType,
    /// New values for insert and update; the statement for sql and create.
    pub row_data: Option<RowValues>,
    /// Key values identifying the row for update and delete.
    pub pk_data: Option<RowValues>,
    pub old_data: Option<RowValues>,
    /// Payload line this record was read from. Zero for records not read from a payload.
    pub line_number: i64,
}

impl CsvData {
    pub fn new(event_type: DataEventType) -> Self {
        Self {
            event_type,
            row_data: None,
            pk_data: None,
            old_data: None,
            line_number: 0,
        }
    }

    pub fn insert(row: RowValues) -> Self {
        Self {
            row_data: Some(row),
            ..Self::new(DataEventType::Insert)
        }
    }

    pub fn update(row: RowValues, pk: RowValues, old: Option<RowValues>) -> Self {
        Self {
            row_data: Some(row),
            pk_data: Some(pk),
            old_data: old,
            ..Self::new(DataEventType::Update)
        }
    }

    pub fn delete(pk: RowValues, old: Option<RowValues>) -> Self {
        Self {
            pk_data: Some(pk),
            old_data: old,
            ..Self::new(DataEventType::Delete)
        }
    }

    pub fn sql(statement: impl Into<String>) -> Self {
        Self {
            row_data: Some(vec![Some(statement.into())]),
            ..Self::new(DataEventType::Sql)
        }
    }
}
