//! `enrich_record` and `find_contact`: per-row calls to the enrichment
//! service with the found fields merged back into the table.
//!
//! - Each row becomes a record of its non-empty cells (optionally limited
//!   to selected columns)
//! - Schema fields are appended as columns in schema order; fields the
//!   service did not return stay empty
//! - Rows whose call failed keep their values and carry a [`RowError`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::{Map, Value};

use crate::data::{Cell, RowError, Table};
use crate::enrichment::{BatchOptions, RequestKind};
use crate::execution::step::{require_input, BlockContext, BlockError, BlockExecutor, BlockOutput};
use crate::workflow::params::{EnrichConfig, FieldSchema, FindContactConfig};

/// Error attached to rows with nothing to send.
const EMPTY_RECORD: &str = "row has no values to enrich";

pub struct EnrichBlock {
    kind: RequestKind,
    schema: FieldSchema,
    columns: Option<Vec<String>>,
    batch_size: usize,
    timeout: Option<Duration>,
    aggressive: bool,
}

impl EnrichBlock {
    /// Lead enrichment with a caller-defined schema.
    pub fn lead(config: EnrichConfig) -> Self {
        Self {
            kind: RequestKind::Lead,
            schema: config.fields,
            columns: config.columns,
            batch_size: config.batch_size,
            timeout: config.timeout.map(Duration::from_secs),
            aggressive: false,
        }
    }

    /// Contact lookup with the fixed contact schema.
    pub fn contact(config: FindContactConfig) -> Self {
        Self {
            kind: RequestKind::Contact,
            schema: FieldSchema::contact(),
            columns: config.columns,
            batch_size: config.batch_size,
            timeout: config.timeout.map(Duration::from_secs),
            aggressive: config.aggressive,
        }
    }

    fn options(&self) -> BatchOptions {
        BatchOptions {
            kind: self.kind,
            batch_size: self.batch_size,
            timeout: self.timeout,
            aggressive: self.aggressive,
        }
    }

    /// Selected columns present in `table`, warning about the rest.
    fn selected_columns(&self, table: &Table, block_id: &str) -> Option<Vec<String>> {
        let requested = self.columns.as_ref()?;
        let (present, missing): (Vec<String>, Vec<String>) =
            requested.iter().cloned().partition(|c| table.column_index(c).is_some());
        if !missing.is_empty() {
            warn!("Block '{}': ignoring unknown columns {:?}", block_id, missing);
        }
        Some(present)
    }
}

#[async_trait]
impl BlockExecutor for EnrichBlock {
    async fn execute(&self, input: Option<Arc<Table>>, ctx: &BlockContext) -> Result<BlockOutput, BlockError> {
        let input = require_input(input, ctx)?;
        let client = ctx.client()?;
        let columns = self.selected_columns(&input, &ctx.block_id);

        // Only rows with at least one value are sent
        let mut sent_rows = Vec::new();
        let mut records = Vec::new();
        for index in 0..input.len() {
            let record = input.record(index, columns.as_deref());
            if !record.is_empty() {
                sent_rows.push(index);
                records.push(record);
            }
        }

        info!(
            "Block '{}': sending {} of {} rows to {} in batches of {}",
            ctx.block_id,
            records.len(),
            input.len(),
            client.service_name(),
            self.batch_size
        );

        // Progress is reported as the input row reached, skipped rows included
        let report = |sent: usize| {
            if let Some(last) = sent.checked_sub(1).and_then(|i| sent_rows.get(i)) {
                ctx.report_rows(last + 1);
            }
        };
        let outcomes = client
            .enrich_batch_reporting(records, &self.schema, &self.options(), &ctx.cancel, &report)
            .await?;

        let mut output = (*input).clone();
        let targets: Vec<(String, usize)> = self
            .schema
            .names()
            .map(|name| (name.to_string(), output.ensure_column(name)))
            .collect();

        let mut outcomes = sent_rows.into_iter().zip(outcomes).peekable();
        let mut enriched = 0;
        let mut failed = 0;
        for index in 0..output.len() {
            let Some(row) = output.row_mut(index) else {
                continue;
            };

            let outcome = match outcomes.peek() {
                Some((sent, _)) if *sent == index => outcomes.next().map(|(_, outcome)| outcome),
                _ => None,
            };

            match outcome {
                Some(Ok(fields)) => {
                    merge_fields(&mut row.values, &targets, &fields);
                    enriched += 1;
                }
                Some(Err(err)) => {
                    row.error = Some(RowError::new(ctx.block_id.as_str(), err.to_string()));
                    failed += 1;
                }
                None => {
                    row.error = Some(RowError::new(ctx.block_id.as_str(), EMPTY_RECORD));
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            warn!("Block '{}': {} of {} rows failed enrichment", ctx.block_id, failed, output.len());
        }
        info!("Block '{}': enriched {} rows", ctx.block_id, enriched);

        Ok(BlockOutput::table(output, input.len()))
    }
}

/// Copies returned schema fields into the row, leaving cells untouched
/// when the service returned nothing for them.
fn merge_fields(values: &mut [Cell], targets: &[(String, usize)], fields: &Map<String, Value>) {
    for (name, index) in targets {
        let Some(value) = fields.get(name) else {
            continue;
        };
        let cell = Cell::from_json(value);
        if !cell.is_empty() {
            if let Some(slot) = values.get_mut(*index) {
                *slot = cell;
            }
        }
    }
}
