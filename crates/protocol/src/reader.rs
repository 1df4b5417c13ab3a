//! Streaming payload reader.

use std::io::BufRead;

use sync_core::row::decode;
use sync_core::{DataEventType, RowValues, SyncError};

use crate::{
    BatchHeader, BinaryEncoding, CsvData, TableHeader, BATCH, BINARY, CATALOG, CHANNEL, COLUMNS,
    COMMIT, CREATE, DELETE, IGNORE, INSERT, KEYS, NODEID, OLD, SCHEMA, SQL, TABLE, UPDATE,
};

/// One element of a payload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Batch(BatchHeader),
    Table(TableHeader),
    Data(CsvData),
    /// End of the batch with the given id.
    Commit(i64),
}

/// Reads [`ProtocolEvent`]s from a buffered source, one line at a time.
pub struct ProtocolReader<R: BufRead> {
    input: R,
    line_number: i64,
    bytes_read: u64,
    source_node_id: String,
    binary_encoding: BinaryEncoding,
    channel_id: String,
    catalog_name: Option<String>,
    schema_name: Option<String>,
    pending_table: Option<TableHeader>,
    table: Option<TableHeader>,
    old_data: Option<RowValues>,
    batch: Option<BatchHeader>,
    ignore_next_batch: bool,
    buf: String,
}

impl<R: BufRead> ProtocolReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line_number: 0,
            bytes_read: 0,
            source_node_id: String::new(),
            binary_encoding: BinaryEncoding::None,
            channel_id: String::new(),
            catalog_name: None,
            schema_name: None,
            pending_table: None,
            table: None,
            old_data: None,
            batch: None,
            ignore_next_batch: false,
            buf: String::new(),
        }
    }

    /// Number of the last line read, starting at 1.
    pub fn line_number(&self) -> i64 {
        self.line_number
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Table header in effect for the rows being read.
    pub fn current_table(&self) -> Option<&TableHeader> {
        self.table.as_ref()
    }

    pub fn next_event(&mut self) -> Result<Option<ProtocolEvent>, SyncError> {
        loop {
            self.buf.clear();
            let read = self.input.read_line(&mut self.buf)?;
            if read == 0 {
                if let Some(batch) = &self.batch {
                    return Err(self.error(format!(
                        "payload ended before batch {} was committed",
                        batch.batch_id
                    )));
                }
                return Ok(None);
            }
            self.line_number += 1;
            self.bytes_read += read as u64;

            let line = self.buf.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            let mut tokens = decode(line).map_err(|e| self.relocate(e))?;
            let keyword = tokens.first().cloned().flatten().unwrap_or_default();
            let args: RowValues = tokens.drain(1..).collect();

            if let Some(event) = self.handle(&keyword, args)? {
                return Ok(Some(event));
            }
        }
    }

    fn handle(
        &mut self,
        keyword: &str,
        args: RowValues,
    ) -> Result<Option<ProtocolEvent>, SyncError> {
        match keyword {
            NODEID => self.source_node_id = self.required(&args, NODEID)?,
            BINARY => {
                let value = self.required(&args, BINARY)?;
                self.binary_encoding = BinaryEncoding::parse(&value)
                    .ok_or_else(|| self.error(format!("unknown binary encoding '{value}'")))?;
            }
            CHANNEL => self.channel_id = self.required(&args, CHANNEL)?,
            BATCH => {
                let value = self.required(&args, BATCH)?;
                let batch_id = value
                    .parse::<i64>()
                    .map_err(|_| self.error(format!("invalid batch id '{value}'")))?;
                let header = BatchHeader {
                    batch_id,
                    source_node_id: self.source_node_id.clone(),
                    channel_id: self.channel_id.clone(),
                    binary_encoding: self.binary_encoding,
                    ignored: std::mem::take(&mut self.ignore_next_batch),
                };
                self.batch = Some(header.clone());
                self.table = None;
                self.old_data = None;
                return Ok(Some(ProtocolEvent::Batch(header)));
            }
            IGNORE => self.ignore_next_batch = true,
            CATALOG => self.catalog_name = non_blank(&args),
            SCHEMA => self.schema_name = non_blank(&args),
            TABLE => {
                let name = self.required(&args, TABLE)?;
                let mut table = TableHeader::new(name, Vec::new(), Vec::new());
                table.catalog_name = self.catalog_name.clone();
                table.schema_name = self.schema_name.clone();
                self.pending_table = Some(table);
            }
            KEYS => {
                let table = self.pending_mut(KEYS)?;
                table.pk_column_names = args.into_iter().flatten().collect();
            }
            COLUMNS => {
                let mut table = self
                    .pending_table
                    .take()
                    .ok_or_else(|| self.error("columns line without a table line".to_string()))?;
                table.column_names = args.into_iter().flatten().collect();
                self.table = Some(table.clone());
                return Ok(Some(ProtocolEvent::Table(table)));
            }
            OLD => self.old_data = Some(args),
            INSERT => {
                self.require_table(INSERT)?;
                return Ok(Some(self.data(CsvData::insert(args))));
            }
            UPDATE => {
                let column_count = self.require_table(UPDATE)?.column_names.len();
                if args.len() <= column_count {
                    return Err(self.error(format!(
                        "update has {} values but table '{}' has {} columns and at least one key",
                        args.len(),
                        self.table
                            .as_ref()
                            .map(|t| t.fully_qualified_name())
                            .unwrap_or_default(),
                        column_count
                    )));
                }
                let mut row = args;
                let pk = row.split_off(column_count);
                let old = self.old_data.take();
                return Ok(Some(self.data(CsvData::update(row, pk, old))));
            }
            DELETE => {
                self.require_table(DELETE)?;
                let old = self.old_data.take();
                return Ok(Some(self.data(CsvData::delete(args, old))));
            }
            SQL | CREATE => {
                let statement = args.into_iter().next().flatten().unwrap_or_default();
                let mut data = CsvData::sql(statement);
                if keyword == CREATE {
                    data.event_type = DataEventType::Create;
                }
                return Ok(Some(self.data(data)));
            }
            COMMIT => {
                let batch = self
                    .batch
                    .take()
                    .ok_or_else(|| self.error("commit outside of a batch".to_string()))?;
                return Ok(Some(ProtocolEvent::Commit(batch.batch_id)));
            }
            other => {
                tracing::info!(
                    "Unable to handle unknown payload line {} starting with '{}'",
                    self.line_number,
                    other
                );
            }
        }
        Ok(None)
    }

    fn data(&mut self, mut data: CsvData) -> ProtocolEvent {
        data.line_number = self.line_number;
        ProtocolEvent::Data(data)
    }

    fn required(&self, args: &RowValues, keyword: &str) -> Result<String, SyncError> {
        args.first()
            .cloned()
            .flatten()
            .ok_or_else(|| self.error(format!("'{keyword}' line is missing its value")))
    }

    fn pending_mut(&mut self, keyword: &str) -> Result<&mut TableHeader, SyncError> {
        let line = self.line_number;
        self.pending_table.as_mut().ok_or_else(|| SyncError::Protocol {
            line,
            message: format!("'{keyword}' line without a table line"),
        })
    }

    fn require_table(&self, keyword: &str) -> Result<&TableHeader, SyncError> {
        if self.batch.is_none() {
            return Err(self.error(format!("'{keyword}' outside of a batch")));
        }
        self.table
            .as_ref()
            .ok_or_else(|| self.error(format!("'{keyword}' before any table header")))
    }

    fn error(&self, message: String) -> SyncError {
        SyncError::Protocol {
            line: self.line_number,
            message,
        }
    }

    fn relocate(&self, error: SyncError) -> SyncError {
        match error {
            SyncError::Protocol { message, .. } => self.error(message),
            other => other,
        }
    }
}

impl<R: BufRead> Iterator for ProtocolReader<R> {
    type Item = Result<ProtocolEvent, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

fn non_blank(args: &RowValues) -> Option<String> {
    args.first()
        .cloned()
        .flatten()
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolWriter;
    use std::io::Cursor;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    fn events(payload: &str) -> Vec<ProtocolEvent> {
        ProtocolReader::new(Cursor::new(payload.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    const PAYLOAD: &str = "nodeid,corp-000\nbinary,NONE\nchannel,sale\nbatch,5\n\
                           catalog,\nschema,\"public\"\ntable,item\nkeys,id\ncolumns,id,name\n\
                           insert,\"1\",\nold,\"1\",\"a\"\nupdate,\"1\",\"b\",\"1\"\ndelete,\"2\"\n\
                           commit,5\n";

    #[test]
    fn test_reads_headers_rows_and_commit() {
        let events = events(PAYLOAD);
        assert_eq!(events.len(), 6);

        match &events[0] {
            ProtocolEvent::Batch(header) => {
                assert_eq!(header.batch_id, 5);
                assert_eq!(header.source_node_id, "corp-000");
                assert_eq!(header.channel_id, "sale");
            }
            other => panic!("expected batch, got {other:?}"),
        }
        match &events[1] {
            ProtocolEvent::Table(table) => {
                assert_eq!(table.fully_qualified_name(), "public.item");
                assert_eq!(table.pk_indexes(), vec![0]);
            }
            other => panic!("expected table, got {other:?}"),
        }
        match &events[2] {
            ProtocolEvent::Data(data) => {
                assert_eq!(data.row_data, Some(vec![s("1"), None]));
                assert_eq!(data.line_number, 10);
            }
            other => panic!("expected insert, got {other:?}"),
        }
        match &events[3] {
            ProtocolEvent::Data(data) => {
                assert_eq!(data.event_type, DataEventType::Update);
                assert_eq!(data.row_data, Some(vec![s("1"), s("b")]));
                assert_eq!(data.pk_data, Some(vec![s("1")]));
                assert_eq!(data.old_data, Some(vec![s("1"), s("a")]));
            }
            other => panic!("expected update, got {other:?}"),
        }
        match &events[4] {
            ProtocolEvent::Data(data) => {
                assert_eq!(data.event_type, DataEventType::Delete);
                assert_eq!(data.old_data, None);
            }
            other => panic!("expected delete, got {other:?}"),
        }
        assert_eq!(events[5], ProtocolEvent::Commit(5));
    }

    #[test]
    fn test_writer_output_reads_back() {
        let mut writer = ProtocolWriter::new(Vec::new());
        let mut header = BatchHeader::new(9, "store-001", "default");
        header.ignored = true;
        writer.start_batch(&header).unwrap();
        let table = TableHeader::new(
            "note",
            vec!["id".to_string(), "body".to_string()],
            vec!["id".to_string()],
        );
        writer.write_table(&table).unwrap();
        writer
            .write_data(&CsvData::insert(vec![s("1"), s("line one\nline \"two\", ok")]))
            .unwrap();
        writer.end_batch(9).unwrap();
        let bytes = writer.into_inner();

        let events = events(std::str::from_utf8(&bytes).unwrap());
        match &events[0] {
            ProtocolEvent::Batch(header) => {
                assert_eq!(header.batch_id, 9);
                assert!(header.ignored);
            }
            other => panic!("expected batch, got {other:?}"),
        }
        assert_eq!(events[1], ProtocolEvent::Table(table));
        match &events[2] {
            ProtocolEvent::Data(data) => assert_eq!(
                data.row_data,
                Some(vec![s("1"), s("line one\nline \"two\", ok")])
            ),
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_ignore_marks_batch() {
        let mut reader =
            ProtocolReader::new(Cursor::new("nodeid,a\nchannel,c\nignore\nbatch,1\ncommit,1\n"));
        match reader.next_event().unwrap() {
            Some(ProtocolEvent::Batch(header)) => assert!(header.ignored),
            other => panic!("expected batch, got {other:?}"),
        }
        assert_eq!(reader.next_event().unwrap(), Some(ProtocolEvent::Commit(1)));
        assert_eq!(reader.next_event().unwrap(), None);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut reader = ProtocolReader::new(Cursor::new("nodeid,a\nchannel,c\nbatch,1\n"));
        assert!(matches!(reader.next_event().unwrap(), Some(ProtocolEvent::Batch(_))));
        let err = reader.next_event().unwrap_err();
        assert!(matches!(err, SyncError::Protocol { line: 3, .. }));
    }

    #[test]
    fn test_row_before_table_reports_line() {
        let mut reader = ProtocolReader::new(Cursor::new("batch,1\ninsert,\"1\"\n"));
        reader.next_event().unwrap();
        let err = reader.next_event().unwrap_err();
        assert!(matches!(err, SyncError::Protocol { line: 2, .. }));
    }

    #[test]
    fn test_short_update_rejected() {
        let payload = "batch,1\ntable,t\nkeys,id\ncolumns,id,v\nupdate,\"1\",\"2\"\n";
        let mut reader = ProtocolReader::new(Cursor::new(payload));
        reader.next_event().unwrap();
        reader.next_event().unwrap();
        assert!(reader.next_event().is_err());
    }
}
