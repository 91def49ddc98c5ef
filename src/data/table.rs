//! Intermediate Tables
//!
//! The tabular value passed between blocks. A table is an ordered list of
//! named columns plus rows of typed cells. Each row may carry a row-level
//! error recorded by the block that produced it, so soft failures travel
//! with the data instead of hiding in an ad-hoc column.

use std::borrow::Cow;
use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Column name used when a row-level error is rendered into output.
pub const ERROR_COLUMN: &str = "_error";

/// Errors raised when a table is assembled inconsistently.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("row has {actual} values but the table has {expected} columns")]
    ColumnCount { expected: usize, actual: usize },

    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// Missing or blank value
    Empty,
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Cell {
    /// Infers a typed cell from raw text read from a file.
    ///
    /// A typed cell is only produced when it renders back to exactly the
    /// same text, so `19.90`, `TRUE`, zip codes with leading zeros and ids
    /// too long for an `i64` stay text and are written out unchanged.
    /// Text cells still compare numerically through [`Cell::as_f64`].
    pub fn infer(raw: &str) -> Self {
        if raw.is_empty() {
            return Cell::Empty;
        }

        if let Ok(n) = raw.parse::<i64>() {
            if n.to_string() == raw {
                return Cell::Integer(n);
            }
        }

        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() && raw.contains('.') && f.to_string() == raw {
                return Cell::Float(f);
            }
        }

        match raw {
            "true" => Cell::Bool(true),
            "false" => Cell::Bool(false),
            _ => Cell::Text(raw.to_string()),
        }
    }

    /// Converts a JSON value returned by the enrichment service.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Empty,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Integer(i),
                None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Empty),
            },
            Value::String(s) if s.trim().is_empty() => Cell::Empty,
            Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }

    /// Renders the cell as JSON for previews and request payloads.
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Empty => Value::Null,
            Cell::Integer(i) => Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Text(s) => Value::String(s.clone()),
        }
    }

    /// True for missing values and whitespace-only text.
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Numeric view of the cell. Text is parsed on demand.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(i) => Some(*i as f64),
            Cell::Float(f) => Some(*f),
            Cell::Text(s) => {
                let trimmed = s.trim();
                if !trimmed.chars().any(|c| c.is_ascii_digit()) {
                    return None;
                }
                trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
            }
            _ => None,
        }
    }

    /// Boolean view of the cell; text matches `true`/`false` in any case.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(b) => Some(*b),
            Cell::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text view of the cell as it would be written to a file.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Cell::Text(s) => Cow::Borrowed(s.as_str()),
            Cell::Empty => Cow::Borrowed(""),
            other => Cow::Owned(other.to_string()),
        }
    }

    fn estimated_bytes(&self) -> usize {
        let inline = mem::size_of::<Cell>();
        match self {
            Cell::Text(s) => inline + s.capacity(),
            _ => inline,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Integer(i) => write!(f, "{}", i),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

/// A row-level soft failure attached to a row by the block that hit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    /// Block that recorded the failure
    pub block_id: String,
    /// Human-readable description
    pub message: String,
}

impl RowError {
    pub fn new(block_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.block_id, self.message)
    }
}

/// One row of a table: its cell values and an optional row-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Cell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RowError>,
}

impl Row {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values, error: None }
    }

    pub fn with_error(mut self, error: RowError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// An ordered set of named columns and the rows holding their values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    /// Creates an empty table with the given column names.
    pub fn new(columns: Vec<String>) -> Result<Self, TableError> {
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].contains(name) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Creates a table from string cells, inferring cell types.
    ///
    /// Mostly useful for fixtures and small hand-built tables.
    pub fn from_strings(columns: &[&str], rows: &[Vec<&str>]) -> Result<Self, TableError> {
        let mut table = Self::new(columns.iter().map(|c| c.to_string()).collect())?;
        for raw in rows {
            table.push_row(Row::new(raw.iter().map(|v| Cell::infer(v)).collect()))?;
        }
        Ok(table)
    }

    /// Appends a row, checking that its width matches the columns.
    pub fn push_row(&mut self, row: Row) -> Result<(), TableError> {
        if row.values.len() != self.columns.len() {
            return Err(TableError::ColumnCount {
                expected: self.columns.len(),
                actual: row.values.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Mutable access to one row. Callers must keep its width unchanged.
    pub fn row_mut(&mut self, index: usize) -> Option<&mut Row> {
        self.rows.get_mut(index)
    }

    /// Consumes the table, returning its columns and rows.
    pub fn into_parts(self) -> (Vec<String>, Vec<Row>) {
        (self.columns, self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Gets the cell at `row` in the named column.
    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.values.get(index))
    }

    /// Returns the index of `name`, appending an empty column if missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(index) = self.column_index(name) {
            return index;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.values.push(Cell::Empty);
        }
        self.columns.len() - 1
    }

    /// Number of rows carrying a row-level error.
    pub fn error_count(&self) -> usize {
        self.rows.iter().filter(|r| r.has_error()).count()
    }

    /// Rough resident size of the table in bytes, used for store budgeting.
    pub fn estimated_bytes(&self) -> usize {
        let header: usize = self
            .columns
            .iter()
            .map(|c| mem::size_of::<String>() + c.capacity())
            .sum();

        let body: usize = self
            .rows
            .iter()
            .map(|row| {
                let error = row
                    .error
                    .as_ref()
                    .map(|e| e.block_id.capacity() + e.message.capacity())
                    .unwrap_or(0);
                mem::size_of::<Row>()
                    + row.values.iter().map(Cell::estimated_bytes).sum::<usize>()
                    + error
            })
            .sum();

        mem::size_of::<Table>() + header + body
    }

    /// Builds a JSON record from the non-empty cells of a row.
    ///
    /// When `columns` is given only those columns are included.
    pub fn record(&self, row: usize, columns: Option<&[String]>) -> Map<String, Value> {
        let mut record = Map::new();
        let Some(row) = self.rows.get(row) else {
            return record;
        };

        for (name, cell) in self.columns.iter().zip(&row.values) {
            if let Some(selected) = columns {
                if !selected.contains(name) {
                    continue;
                }
            }
            if !cell.is_empty() {
                record.insert(name.clone(), Value::String(cell.as_text().into_owned()));
            }
        }
        record
    }

    /// Returns up to `limit` rows rendered as JSON objects.
    pub fn preview(&self, limit: usize) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                let mut object: Map<String, Value> = self
                    .columns
                    .iter()
                    .zip(&row.values)
                    .map(|(name, cell)| (name.clone(), cell.to_json()))
                    .collect();
                if let Some(error) = &row.error {
                    object.insert(ERROR_COLUMN.to_string(), Value::String(error.message.clone()));
                }
                object
            })
            .collect()
    }
}
