//! Job State
//!
//! The record of one workflow execution: lifecycle status, live progress
//! and the result of every block that ran.
//!
//! ```text
//! pending ──> running ──> completed
//!    │           ├──────> failed
//!    │           └──────> cancelled
//!    └──────────────────> cancelled
//! ```
//!
//! A job in a terminal state is never mutated again.

use std::fmt;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::model::BlockKind;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true for completed, failed and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Rejected status change.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("job {job_id} cannot go from {from} to {to}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Live progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 1-based index of the block being run (0 before the first block)
    pub current_step: usize,
    pub total_steps: usize,
    pub current_block_id: Option<String>,
    pub current_block_name: Option<String>,
    /// Rows consumed by finished blocks
    pub rows_processed: usize,
    /// Input size of the current block, when known
    pub total_rows: Option<usize>,
    pub message: String,
    /// Completion estimate in `[0, 100]`. Each block is an equal share;
    /// within a block the share fills with the rows it has handled.
    pub percentage: f64,
}

impl Progress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            current_step: 0,
            total_steps,
            current_block_id: None,
            current_block_name: None,
            rows_processed: 0,
            total_rows: None,
            message: "Waiting to start".to_string(),
            percentage: 0.0,
        }
    }

    /// Records that the block at 0-based `index` is starting.
    pub fn begin_block(&mut self, index: usize, block_id: &str, block_name: &str, total_rows: Option<usize>) {
        self.current_step = index + 1;
        self.current_block_id = Some(block_id.to_string());
        self.current_block_name = Some(block_name.to_string());
        self.total_rows = total_rows;
        self.message = match total_rows {
            Some(rows) => format!("Running {} on {} rows", block_name, rows),
            None => format!("Running {}", block_name),
        };
        self.percentage = self.fraction(index as f64);
    }

    /// Records that the current block has handled `rows_done` of its input rows.
    pub fn advance_rows(&mut self, rows_done: usize) {
        let Some(total) = self.total_rows.filter(|total| *total > 0) else {
            return;
        };
        let rows_done = rows_done.min(total);
        let step = self.current_step.saturating_sub(1) as f64;
        self.percentage = self.fraction(step + rows_done as f64 / total as f64);
        if let Some(name) = &self.current_block_name {
            self.message = format!("Running {}: {} of {} rows", name, rows_done, total);
        }
    }

    /// Records that the block at 0-based `index` finished after reading `rows_in` rows.
    pub fn finish_block(&mut self, index: usize, rows_in: usize) {
        self.rows_processed += rows_in;
        self.percentage = self.fraction((index + 1) as f64);
        if let Some(name) = &self.current_block_name {
            self.message = format!("Finished {}", name);
        }
    }

    /// Marks every step as done.
    pub fn finish(&mut self, message: impl Into<String>) {
        self.percentage = 100.0;
        self.message = message.into();
    }

    fn fraction(&self, steps_done: f64) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        (steps_done / self.total_steps as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Outcome of one executed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResult {
    pub block_id: String,
    pub kind: BlockKind,
    pub success: bool,
    pub rows_in: usize,
    pub rows_out: usize,
    /// Rows carrying a row-level error after this block
    pub row_errors: usize,
    /// File written by persist blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<Map<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BlockResult {
    /// Result of a block that failed before producing output.
    pub fn failed(block_id: &str, kind: BlockKind, rows_in: usize, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            block_id: block_id.to_string(),
            kind,
            success: false,
            rows_in,
            rows_out: 0,
            row_errors: 0,
            output_path: None,
            duration_ms,
            preview: None,
            error: Some(error.into()),
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: JobStatus,
    pub progress: Progress,
    /// Results in execution order
    pub results: Vec<BlockResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub final_output_path: Option<String>,
}

impl Job {
    /// Creates a pending job for a workflow of `total_steps` blocks.
    pub fn new(workflow_id: &str, workflow_name: &str, total_steps: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            status: JobStatus::Pending,
            progress: Progress::new(total_steps),
            results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            final_output_path: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: JobStatus, allowed_from: &[JobStatus]) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// pending -> running
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running, &[JobStatus::Pending])?;
        self.started_at = Some(Utc::now());
        self.progress.message = "Starting".to_string();
        Ok(())
    }

    /// running -> completed
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed, &[JobStatus::Running])?;
        self.progress.finish("Completed");
        Ok(())
    }

    /// pending | running -> failed
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed, &[JobStatus::Pending, JobStatus::Running])?;
        let message = message.into();
        self.progress.message = format!("Failed: {}", message);
        self.error_message = Some(message);
        Ok(())
    }

    /// pending | running -> cancelled
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled, &[JobStatus::Pending, JobStatus::Running])?;
        self.progress.message = "Cancelled".to_string();
        Ok(())
    }

    /// Appends a block result. Ignored once the job is terminal.
    pub fn record_result(&mut self, result: BlockResult) {
        if self.is_terminal() {
            warn!("Job {} is {}; dropping result for '{}'", self.id, self.status, result.block_id);
            return;
        }
        if result.success {
            if let Some(path) = &result.output_path {
                self.final_output_path = Some(path.clone());
            }
        }
        self.results.push(result);
    }

    /// Snapshot of what the job has produced so far.
    pub fn results_summary(&self) -> JobResults {
        JobResults {
            job_id: self.id.clone(),
            status: self.status,
            results: self.results.clone(),
            final_output_path: self.final_output_path.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Results view of a job returned by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: String,
    pub status: JobStatus,
    pub results: Vec<BlockResult>,
    pub final_output_path: Option<String>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(block_id: &str, output_path: Option<&str>) -> BlockResult {
        BlockResult {
            block_id: block_id.to_string(),
            kind: BlockKind::PersistTable,
            success: true,
            rows_in: 3,
            rows_out: 0,
            row_errors: 0,
            output_path: output_path.map(str::to_string),
            duration_ms: 1,
            preview: None,
            error: None,
        }
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new("wf-1", "Leads", 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress.total_steps, 3);
        assert_eq!(job.progress.percentage, 0.0);
        assert!(job.started_at.is_none());
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new("wf-1", "Leads", 1);
        job.start().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        job.complete().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.progress.percentage, 100.0);
    }

    #[test]
    fn test_progress_fills_with_rows() {
        let mut progress = Progress::new(4);
        progress.begin_block(1, "enrich", "Enrich", Some(200));
        assert_eq!(progress.percentage, 25.0);

        progress.advance_rows(100);
        assert_eq!(progress.percentage, 37.5);
        assert_eq!(progress.message, "Running Enrich: 100 of 200 rows");

        // Never past the block's own share
        progress.advance_rows(500);
        assert_eq!(progress.percentage, 50.0);

        progress.finish_block(1, 200);
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.rows_processed, 200);

        // Blocks without a known input size only move per step
        progress.begin_block(2, "load", "Load", None);
        progress.advance_rows(10);
        assert_eq!(progress.percentage, 50.0);
    }

    #[test]
    fn test_cancel_pending_job() {
        let mut job = Job::new("wf-1", "Leads", 1);
        job.cancel().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_terminal_job_is_frozen() {
        let mut job = Job::new("wf-1", "Leads", 1);
        job.start().unwrap();
        job.fail("boom").unwrap();
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        let err = job.complete().unwrap_err();
        assert_eq!(err.from, JobStatus::Failed);
        assert!(job.cancel().is_err());
        assert!(job.start().is_err());

        job.record_result(ok_result("late", None));
        assert!(job.results.is_empty());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_complete_requires_running() {
        let mut job = Job::new("wf-1", "Leads", 1);
        assert!(job.complete().is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_final_output_path_is_last_persist() {
        let mut job = Job::new("wf-1", "Leads", 2);
        job.start().unwrap();
        job.record_result(ok_result("save_a", Some("a.csv")));
        job.record_result(ok_result("save_b", Some("b.csv")));

        let summary = job.results_summary();
        assert_eq!(summary.final_output_path.as_deref(), Some("b.csv"));
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.status, JobStatus::Running);
    }

    #[test]
    fn test_progress_percentage() {
        let mut progress = Progress::new(4);
        progress.begin_block(0, "load", "Load leads", None);
        assert_eq!(progress.current_step, 1);
        assert_eq!(progress.percentage, 0.0);

        progress.finish_block(0, 100);
        assert_eq!(progress.percentage, 25.0);
        assert_eq!(progress.rows_processed, 100);

        progress.begin_block(1, "filter", "Only Acme", Some(100));
        assert_eq!(progress.total_rows, Some(100));
        assert!(progress.message.contains("100 rows"));
        progress.finish_block(1, 100);
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.rows_processed, 200);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let mut job = Job::new("wf-1", "Leads", 1);
        job.start().unwrap();
        job.record_result(ok_result("save", Some("out.csv")));

        let json = serde_json::to_string_pretty(&job).unwrap();
        let loaded: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, job);
    }
}
