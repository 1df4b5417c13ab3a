//! Column transforms applied to rows on their way out of, or into, a node.
//!
//! Rules are configured per table and per point in the pipeline:
//!
//! ```yaml
//! - point: extract
//!   table: item
//!   rules:
//!     - { rename: { from: name, to: title } }
//!     - { constant: { column: origin, value: corp } }
//! ```
//!
//! A rule list compiles into a [`TablePlan`] that rewrites the table header
//! once and then maps every row in a single pass.

use serde::{Deserialize, Serialize};

use symmetric_sync_protocol::{CsvData, TableHeader};
use sync_core::RowValues;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRule {
    Copy { from: String, to: String },
    Constant { column: String, value: String },
    Remove { column: String },
    Rename { from: String, to: String },
    Lowercase { column: String },
    Uppercase { column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformPoint {
    Extract,
    Load,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTransform {
    pub point: TransformPoint,
    /// Table name, matched case-insensitively against the unqualified name.
    pub table: String,
    pub rules: Vec<TransformRule>,
}

/// Every configured transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformSet {
    transforms: Vec<TableTransform>,
}

impl TransformSet {
    pub fn new(transforms: Vec<TableTransform>) -> Self {
        Self { transforms }
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Plan for a table at a point, or `None` when no rule applies to it.
    pub fn plan(&self, point: TransformPoint, table: &TableHeader) -> Option<TablePlan> {
        let rules: Vec<&TransformRule> = self
            .transforms
            .iter()
            .filter(|t| t.point == point && t.table.eq_ignore_ascii_case(&table.table_name))
            .flat_map(|t| t.rules.iter())
            .collect();
        if rules.is_empty() {
            return None;
        }
        Some(TablePlan::compile(table, &rules))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Column(usize),
    Constant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Keep,
    Lower,
    Upper,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputColumn {
    name: String,
    source: Source,
    case: Case,
}

/// Compiled transform for one table header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    header: TableHeader,
    columns: Vec<OutputColumn>,
    /// For each output key column, its position in the input key list.
    pk_sources: Vec<(usize, Case)>,
}

impl TablePlan {
    fn compile(input: &TableHeader, rules: &[&TransformRule]) -> Self {
        let mut columns: Vec<OutputColumn> = input
            .column_names
            .iter()
            .enumerate()
            .map(|(i, name)| OutputColumn {
                name: name.clone(),
                source: Source::Column(i),
                case: Case::Keep,
            })
            .collect();
        let find = |columns: &[OutputColumn], name: &str| {
            columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
        };

        for rule in rules {
            match rule {
                TransformRule::Copy { from, to } => {
                    if let Some(i) = find(&columns, from) {
                        let copied = OutputColumn {
                            name: to.clone(),
                            ..columns[i].clone()
                        };
                        match find(&columns, to) {
                            Some(j) => columns[j] = copied,
                            None => columns.push(copied),
                        }
                    }
                }
                TransformRule::Constant { column, value } => {
                    let constant = OutputColumn {
                        name: column.clone(),
                        source: Source::Constant(value.clone()),
                        case: Case::Keep,
                    };
                    match find(&columns, column) {
                        Some(i) => columns[i] = constant,
                        None => columns.push(constant),
                    }
                }
                TransformRule::Remove { column } => {
                    if let Some(i) = find(&columns, column) {
                        columns.remove(i);
                    }
                }
                TransformRule::Rename { from, to } => {
                    if let Some(i) = find(&columns, from) {
                        columns[i].name = to.clone();
                    }
                }
                TransformRule::Lowercase { column } => {
                    if let Some(i) = find(&columns, column) {
                        columns[i].case = Case::Lower;
                    }
                }
                TransformRule::Uppercase { column } => {
                    if let Some(i) = find(&columns, column) {
                        columns[i].case = Case::Upper;
                    }
                }
            }
        }

        // Key columns keep their input order and follow renames of the column they came from.
        let mut pk_sources = Vec::new();
        let mut pk_names = Vec::new();
        for (pk_position, pk_name) in input.pk_column_names.iter().enumerate() {
            let Some(input_index) = input.column_index(pk_name) else {
                continue;
            };
            if let Some(column) = columns
                .iter()
                .find(|c| c.source == Source::Column(input_index))
            {
                pk_sources.push((pk_position, column.case));
                pk_names.push(column.name.clone());
            }
        }

        let header = TableHeader {
            column_names: columns.iter().map(|c| c.name.clone()).collect(),
            pk_column_names: pk_names,
            ..input.clone()
        };
        Self {
            header,
            columns,
            pk_sources,
        }
    }

    /// The header rows are written under after the transform.
    pub fn header(&self) -> &TableHeader {
        &self.header
    }

    pub fn apply(&self, data: &CsvData) -> CsvData {
        if !data.event_type.is_dml() {
            return data.clone();
        }
        CsvData {
            row_data: data.row_data.as_ref().map(|row| self.map_row(row)),
            old_data: data.old_data.as_ref().map(|row| self.map_row(row)),
            pk_data: data.pk_data.as_ref().map(|pk| self.map_pk(pk)),
            ..data.clone()
        }
    }

    fn map_row(&self, row: &[Option<String>]) -> RowValues {
        self.columns
            .iter()
            .map(|column| {
                let value = match &column.source {
                    Source::Column(i) => row.get(*i).cloned().flatten(),
                    Source::Constant(value) => Some(value.clone()),
                };
                apply_case(value, column.case)
            })
            .collect()
    }

    fn map_pk(&self, pk: &[Option<String>]) -> RowValues {
        self.pk_sources
            .iter()
            .map(|(i, case)| apply_case(pk.get(*i).cloned().flatten(), *case))
            .collect()
    }
}

fn apply_case(value: Option<String>, case: Case) -> Option<String> {
    match case {
        Case::Keep => value,
        Case::Lower => value.map(|v| v.to_lowercase()),
        Case::Upper => value.map(|v| v.to_uppercase()),
    }
}
