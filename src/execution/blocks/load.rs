//! `load_table`: reads a delimited text file into a table.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::data::{Cell, Row, Table};
use crate::execution::step::{BlockContext, BlockError, BlockExecutor, BlockOutput};
use crate::workflow::params::{LoadTableConfig, TextEncoding};

pub struct LoadTableBlock {
    config: LoadTableConfig,
}

impl LoadTableBlock {
    pub fn new(config: LoadTableConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BlockExecutor for LoadTableBlock {
    async fn execute(&self, _input: Option<Arc<Table>>, ctx: &BlockContext) -> Result<BlockOutput, BlockError> {
        let path = ctx.resolve_path(&self.config.file_path);
        let display = path.display().to_string();
        debug!("Reading {} ({}, skip {} rows)", display, self.config.encoding, self.config.skip_rows);

        let bytes = tokio::fs::read(&path).await.map_err(|e| BlockError::SourceRead {
            path: display.clone(),
            message: match e.kind() {
                ErrorKind::NotFound => "file not found".to_string(),
                _ => e.to_string(),
            },
        })?;

        let text = decode_text(&bytes, self.config.encoding).map_err(|message| BlockError::SourceRead {
            path: display.clone(),
            message,
        })?;
        let table = parse_table(skip_lines(&text, self.config.skip_rows), self.config.delimiter.byte(), &path)?;

        info!("Loaded {} rows x {} columns from {}", table.len(), table.columns().len(), display);
        let rows = table.len();
        Ok(BlockOutput::table(table, rows))
    }
}

/// Decodes raw file bytes, dropping a UTF-8 byte order mark.
pub(crate) fn decode_text(bytes: &[u8], encoding: TextEncoding) -> Result<String, String> {
    match encoding {
        TextEncoding::Utf8 => {
            let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
            String::from_utf8(bytes.to_vec())
                .map_err(|e| format!("not valid UTF-8 (byte {}); try encoding latin-1", e.utf8_error().valid_up_to()))
        }
        // Latin-1 maps every byte to the code point of the same value
        TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn skip_lines(text: &str, count: usize) -> &str {
    if count == 0 {
        return text;
    }
    match text.match_indices('\n').nth(count - 1) {
        Some((index, _)) => &text[index + 1..],
        None => "",
    }
}

/// Makes header names unique and non-blank.
fn header_names(raw: &csv::StringRecord) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(raw.len());
    for (i, name) in raw.iter().enumerate() {
        let base = match name.trim() {
            "" => format!("column_{}", i + 1),
            trimmed => trimmed.to_string(),
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while names.contains(&candidate) {
            candidate = format!("{}.{}", base, suffix);
            suffix += 1;
        }
        names.push(candidate);
    }
    names
}

fn parse_table(text: &str, delimiter: u8, path: &Path) -> Result<Table, BlockError> {
    let source_error = |message: String| BlockError::SourceRead {
        path: path.display().to_string(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(|e| source_error(e.to_string()))?.clone();
    if headers.is_empty() {
        return Err(source_error("file has no header row".to_string()));
    }

    let mut table = Table::new(header_names(&headers))?;
    for record in reader.records() {
        let record = record.map_err(|e| source_error(format!("malformed row: {}", e)))?;
        table.push_row(Row::new(record.iter().map(Cell::infer).collect()))?;
    }
    Ok(table)
}
