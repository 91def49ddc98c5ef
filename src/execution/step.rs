//! Block Execution
//!
//! The contract every block implementation follows:
//! - [`BlockExecutor`]: runs one block against its (optional) input table
//! - [`BlockContext`]: job-scoped resources handed to each block
//! - [`BlockOutput`]: the produced table and row counters
//! - [`BlockError`]: block-fatal failures that stop the job

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::data::{StoreError, Table, TableError};
use crate::enrichment::{EnrichmentClient, EnrichmentError};

/// Failures that abort a block and, with it, the job.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("failed to read '{path}': {message}")]
    SourceRead { path: String, message: String },

    #[error("failed to write '{path}': {message}")]
    SinkWrite { path: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("enrichment service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("block '{0}' has no input table")]
    MissingInput(String),

    #[error("cancelled while running block")]
    Cancelled,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EnrichmentError> for BlockError {
    fn from(err: EnrichmentError) -> Self {
        match err {
            EnrichmentError::CircuitOpen { .. } => BlockError::ServiceUnavailable(err.to_string()),
            EnrichmentError::Cancelled => BlockError::Cancelled,
        }
    }
}

/// What a block produced.
#[derive(Debug, Default)]
pub struct BlockOutput {
    /// The output table; `None` for sink blocks
    pub table: Option<Table>,
    pub rows_in: usize,
    pub rows_out: usize,
    /// Rows carrying a row-level error after this block
    pub row_errors: usize,
    /// File written by the block, if any
    pub output_path: Option<String>,
}

impl BlockOutput {
    /// Output of a block that passes a table on.
    pub fn table(table: Table, rows_in: usize) -> Self {
        Self {
            rows_out: table.len(),
            row_errors: table.error_count(),
            table: Some(table),
            rows_in,
            output_path: None,
        }
    }
}

/// Resources available to a block while it runs.
#[derive(Clone)]
pub struct BlockContext {
    pub job_id: String,
    pub block_id: String,
    /// Directory relative file paths are resolved against
    pub data_dir: PathBuf,
    pub client: Option<EnrichmentClient>,
    pub cancel: CancellationToken,
    rows_done: Option<Arc<watch::Sender<usize>>>,
}

impl BlockContext {
    pub fn new(job_id: &str, block_id: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.to_string(),
            block_id: block_id.to_string(),
            data_dir: data_dir.into(),
            client: None,
            cancel: CancellationToken::new(),
            rows_done: None,
        }
    }

    pub fn with_client(mut self, client: Option<EnrichmentClient>) -> Self {
        self.client = client;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Routes [`BlockContext::report_rows`] to `sender`.
    pub fn with_row_progress(mut self, sender: watch::Sender<usize>) -> Self {
        self.rows_done = Some(Arc::new(sender));
        self
    }

    /// Reports how many input rows the block has handled so far.
    pub fn report_rows(&self, rows_done: usize) {
        if let Some(sender) = &self.rows_done {
            sender.send_replace(rows_done);
        }
    }

    /// Resolves a user-supplied path against the data directory.
    ///
    /// Absolute paths are kept; a leading `./` is dropped first.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let trimmed = path.trim();
        let relative = trimmed.strip_prefix("./").unwrap_or(trimmed);
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.data_dir.join(candidate)
        }
    }

    /// The enrichment client, or an error when none is configured.
    pub fn client(&self) -> Result<&EnrichmentClient, BlockError> {
        self.client
            .as_ref()
            .ok_or_else(|| BlockError::ServiceUnavailable("no enrichment client configured".to_string()))
    }
}

/// Runs one block.
///
/// Source blocks receive `None`; every other block receives the table
/// produced by its single predecessor.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&self, input: Option<Arc<Table>>, ctx: &BlockContext) -> Result<BlockOutput, BlockError>;
}

/// Unwraps the input table of a block that requires one.
pub fn require_input(input: Option<Arc<Table>>, ctx: &BlockContext) -> Result<Arc<Table>, BlockError> {
    input.ok_or_else(|| BlockError::MissingInput(ctx.block_id.clone()))
}
