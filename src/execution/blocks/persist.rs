//! `persist_table`: writes a table to a delimited text file.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use log::{info, warn};

use crate::data::{Table, ERROR_COLUMN};
use crate::execution::step::{require_input, BlockContext, BlockError, BlockExecutor, BlockOutput};
use crate::workflow::params::{PersistTableConfig, TextEncoding};

/// Header of the optional row index column.
const INDEX_COLUMN: &str = "index";

pub struct PersistTableBlock {
    config: PersistTableConfig,
}

impl PersistTableBlock {
    pub fn new(config: PersistTableConfig) -> Self {
        Self { config }
    }

    fn output_path(&self, ctx: &BlockContext) -> PathBuf {
        match &self.config.file_path {
            Some(path) if !path.trim().is_empty() => ctx.resolve_path(path),
            _ => ctx.data_dir.join(format!(
                "output_{}_{}.csv",
                ctx.block_id,
                Local::now().format("%Y%m%d_%H%M%S")
            )),
        }
    }
}

#[async_trait]
impl BlockExecutor for PersistTableBlock {
    async fn execute(&self, input: Option<Arc<Table>>, ctx: &BlockContext) -> Result<BlockOutput, BlockError> {
        let input = require_input(input, ctx)?;
        let path = self.output_path(ctx);
        let display = path.display().to_string();
        let sink_error = |message: String| BlockError::SinkWrite {
            path: display.clone(),
            message,
        };

        let text = render_csv(&input, self.config.delimiter.byte(), self.config.index)?;
        let bytes = encode_text(&text, self.config.encoding, &ctx.block_id);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| sink_error(e.to_string()))?;
            }
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| sink_error(e.to_string()))?;

        let row_errors = input.error_count();
        info!("Wrote {} rows to {} ({} with errors)", input.len(), display, row_errors);

        Ok(BlockOutput {
            table: None,
            rows_in: input.len(),
            rows_out: input.len(),
            row_errors,
            output_path: Some(display),
        })
    }
}

/// Renders the table as delimited text. The error column is only added
/// when some row carries an error.
fn render_csv(table: &Table, delimiter: u8, index: bool) -> Result<String, BlockError> {
    let with_errors = table.error_count() > 0;
    let mut writer = csv::WriterBuilder::new().delimiter(delimiter).from_writer(Vec::new());

    let mut header: Vec<&str> = Vec::with_capacity(table.columns().len() + 2);
    if index {
        header.push(INDEX_COLUMN);
    }
    header.extend(table.columns().iter().map(String::as_str));
    if with_errors {
        header.push(ERROR_COLUMN);
    }
    writer.write_record(&header)?;

    for (i, row) in table.rows().iter().enumerate() {
        let mut record: Vec<String> = Vec::with_capacity(header.len());
        if index {
            record.push(i.to_string());
        }
        record.extend(row.values.iter().map(|cell| cell.as_text().into_owned()));
        if with_errors {
            record.push(row.error.as_ref().map(|e| e.message.clone()).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|e| BlockError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| BlockError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Encodes text for writing. Characters outside Latin-1 become `?`.
fn encode_text(text: &str, encoding: TextEncoding, block_id: &str) -> Vec<u8> {
    match encoding {
        TextEncoding::Utf8 => text.as_bytes().to_vec(),
        TextEncoding::Latin1 => {
            let mut replaced = 0;
            let bytes = text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).unwrap_or_else(|_| {
                        replaced += 1;
                        b'?'
                    })
                })
                .collect();
            if replaced > 0 {
                warn!("Block '{}': {} characters not representable in latin-1 were replaced", block_id, replaced);
            }
            bytes
        }
    }
}
