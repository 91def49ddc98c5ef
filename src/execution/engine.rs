//! Pipeline Scheduler
//!
//! Runs the blocks of one job in plan order:
//! - Feeds each block the table its predecessor left in the job's store
//! - Records a [`BlockResult`] per executed block, timed by the timeline
//! - Publishes job snapshots after every state change
//! - Observes cancellation between blocks (and between enrichment batches)
//! - Reports progress to the job store without letting its failures
//!   affect the run

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::data::TableStore;
use crate::enrichment::EnrichmentClient;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::persistence::JobStore;
use crate::workflow::{BlockResult, ExecutionPlan, Job, PlannedStep};

use super::blocks::executor_for;
use super::step::{BlockContext, BlockError, BlockOutput};

/// Default byte budget of a job's table store.
pub const DEFAULT_STORE_BUDGET: usize = 256 * 1024 * 1024;

/// Default number of rows kept in block previews.
pub const DEFAULT_PREVIEW_ROWS: usize = 5;

/// Executes the plan of one workflow.
///
/// # Example
///
/// ```rust,no_run
/// use leadflow::execution::Engine;
/// use leadflow::{load_and_plan, Job};
/// use tokio::sync::watch;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let (_, _, plan) = load_and_plan("leads.yaml")?;
/// let mut engine = Engine::new(plan);
/// engine.set_data_dir("./uploads");
///
/// let job = Job::new(&engine.plan().workflow_id, &engine.plan().workflow_name, engine.plan().len());
/// let (updates, _) = watch::channel(job.clone());
/// let job = engine.run(job, &updates, &CancellationToken::new()).await;
/// println!("{}", job.status);
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    plan: ExecutionPlan,
    data_dir: PathBuf,
    store_budget: usize,
    preview_rows: usize,
    client: Option<EnrichmentClient>,
    persistence: Option<Arc<dyn JobStore>>,
}

impl Engine {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            plan,
            data_dir: PathBuf::from("."),
            store_budget: DEFAULT_STORE_BUDGET,
            preview_rows: DEFAULT_PREVIEW_ROWS,
            client: None,
            persistence: None,
        }
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Sets the directory relative block paths resolve against.
    pub fn set_data_dir(&mut self, dir: impl Into<PathBuf>) {
        self.data_dir = dir.into();
    }

    /// Sets the byte budget of the job's table store.
    pub fn set_store_budget(&mut self, bytes: usize) {
        self.store_budget = bytes;
    }

    pub fn set_preview_rows(&mut self, rows: usize) {
        self.preview_rows = rows;
    }

    /// Sets the shared enrichment client used by enrichment blocks.
    pub fn set_client(&mut self, client: EnrichmentClient) {
        self.client = Some(client);
    }

    pub fn set_persistence(&mut self, store: Arc<dyn JobStore>) {
        self.persistence = Some(store);
    }

    /// Runs `job` to a terminal state and returns it.
    ///
    /// Every change is also sent through `updates`. A job that is already
    /// cancelled when this is called goes straight from pending to
    /// cancelled without running any block.
    pub async fn run(&self, mut job: Job, updates: &watch::Sender<Job>, cancel: &CancellationToken) -> Job {
        if cancel.is_cancelled() {
            info!("Job {} cancelled before it started", job.id);
            self.transition(&mut job, |job| job.cancel());
            self.publish(&job, updates).await;
            return job;
        }

        self.transition(&mut job, |job| job.start());
        self.publish(&job, updates).await;
        info!(
            "Starting job {} for workflow '{}' ({} blocks)",
            job.id,
            self.plan.workflow_name,
            self.plan.len()
        );

        let mut store = TableStore::new(self.store_budget);
        let mut timeline = ExecutionTimeline::new();

        for (index, step) in self.plan.steps().iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Job {} cancelled before block '{}'", job.id, step.id());
                self.transition(&mut job, |job| job.cancel());
                break;
            }

            match self.run_step(index, step, &mut job, &mut store, &mut timeline, updates, cancel).await {
                Ok(()) => {}
                Err(BlockError::Cancelled) => {
                    info!("Job {} cancelled during block '{}'", job.id, step.id());
                    self.transition(&mut job, |job| job.cancel());
                    break;
                }
                Err(e) => {
                    let message = format!("Block '{}' failed: {}", step.id(), e);
                    error!("Job {}: {}", job.id, message);
                    self.transition(&mut job, |job| job.fail(message));
                    break;
                }
            }
        }

        if !job.is_terminal() {
            self.transition(&mut job, |job| job.complete());
        }
        store.clear();

        info!("Job {} finished: {}", job.id, job.status);
        info!("{}", timeline.gantt_chart());
        self.publish(&job, updates).await;
        job
    }

    /// Runs one block and records its result. A failed block's result is
    /// recorded before its error is returned.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        index: usize,
        step: &PlannedStep,
        job: &mut Job,
        store: &mut TableStore,
        timeline: &mut ExecutionTimeline,
        updates: &watch::Sender<Job>,
        cancel: &CancellationToken,
    ) -> Result<(), BlockError> {
        let block = &step.block;
        let input = match step.input.as_deref().map(|source| store.get(source)).transpose() {
            Ok(input) => input,
            Err(e) => {
                let e = BlockError::from(e);
                let result = BlockResult::failed(&block.id, block.kind(), 0, 0, e.to_string());
                self.record(job, result).await;
                return Err(e);
            }
        };
        let rows_in = input.as_ref().map(|table| table.len());

        job.progress.begin_block(index, &block.id, &block.name, rows_in);
        self.publish(job, updates).await;
        timeline.record(&block.id, EventType::Started);
        info!("Running block '{}' ({})", block.id, block.kind());

        let (rows_sender, mut rows_done) = watch::channel(0usize);
        let ctx = BlockContext::new(&job.id, &block.id, &self.data_dir)
            .with_client(self.client.clone())
            .with_cancel(cancel.clone())
            .with_row_progress(rows_sender);
        let executor = executor_for(block);
        let execution = executor.execute(input, &ctx);
        tokio::pin!(execution);
        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                changed = rows_done.changed() => {
                    if changed.is_err() {
                        break (&mut execution).await;
                    }
                    let rows = *rows_done.borrow_and_update();
                    job.progress.advance_rows(rows);
                    updates.send_replace(job.clone());
                }
            }
        };

        if let Some(source) = &step.input {
            store.mark_consumed(source);
        }

        let stored = outcome.and_then(|output| self.store_output(step, output, store));
        let (event, result) = match &stored {
            Ok(result) => (EventType::Completed, result.clone()),
            Err(e) => {
                let event = match e {
                    BlockError::Cancelled => EventType::Cancelled,
                    _ => EventType::Failed,
                };
                (
                    event,
                    BlockResult::failed(&block.id, block.kind(), rows_in.unwrap_or(0), 0, e.to_string()),
                )
            }
        };

        timeline.record(&block.id, event);
        let result = BlockResult {
            duration_ms: timeline
                .duration_of(&block.id)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            ..result
        };

        match &stored {
            Ok(_) => info!(
                "Block '{}' done: {} -> {} rows ({} row errors) in {} ms",
                block.id, result.rows_in, result.rows_out, result.row_errors, result.duration_ms
            ),
            Err(e) => warn!("Block '{}' stopped after {} ms: {}", block.id, result.duration_ms, e),
        }

        let rows_done = result.rows_in;
        self.record(job, result).await;
        if stored.is_ok() {
            job.progress.finish_block(index, rows_done);
            self.publish(job, updates).await;
        }
        stored.map(|_| ())
    }

    /// Moves a block's table into the store and builds its result.
    fn store_output(
        &self,
        step: &PlannedStep,
        output: BlockOutput,
        store: &mut TableStore,
    ) -> Result<BlockResult, BlockError> {
        let BlockOutput {
            table,
            rows_in,
            rows_out,
            row_errors,
            output_path,
        } = output;

        let preview = match table {
            Some(table) => {
                let preview = table.preview(self.preview_rows);
                store.put(step.id(), table, step.consumers.len())?;
                Some(preview)
            }
            None => None,
        };

        Ok(BlockResult {
            block_id: step.block.id.clone(),
            kind: step.block.kind(),
            success: true,
            rows_in,
            rows_out,
            row_errors,
            output_path,
            duration_ms: 0,
            preview,
            error: None,
        })
    }

    fn transition<F, E>(&self, job: &mut Job, change: F)
    where
        F: FnOnce(&mut Job) -> Result<(), E>,
        E: std::fmt::Display,
    {
        if let Err(e) = change(job) {
            warn!("Ignoring job state change: {}", e);
        }
    }

    async fn record(&self, job: &mut Job, result: BlockResult) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.append_block_result(&job.id, &result).await {
                warn!("Failed to persist result of '{}' for job {}: {}", result.block_id, job.id, e);
            }
        }
        job.record_result(result);
    }

    /// Stores the snapshot, then notifies watchers, so a watcher that sees
    /// a terminal state can read it back from the store.
    async fn publish(&self, job: &Job, updates: &watch::Sender<Job>) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save_job_snapshot(job).await {
                warn!("Failed to persist snapshot of job {}: {}", job.id, e);
            }
        }
        updates.send_replace(job.clone());
    }
}
