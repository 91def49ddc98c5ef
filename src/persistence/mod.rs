//! Persistence Module
//!
//! Where workflow definitions and job records live between runs.
//!
//! - [`MemoryStore`]: in-process storage, used when no state directory is set
//! - [`FileStore`]: JSON files under a state directory
//!
//! The scheduler reports through [`JobStore`] but never fails a job
//! because persistence failed; errors are logged and execution goes on.

pub mod file;
pub mod memory;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::workflow::{BlockResult, Job, WorkflowDefinition};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage of workflows and job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, PersistenceError>;

    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), PersistenceError>;

    /// Replaces the stored snapshot of a job.
    async fn save_job_snapshot(&self, job: &Job) -> Result<(), PersistenceError>;

    /// Appends one block result to the job's result log.
    async fn append_block_result(&self, job_id: &str, result: &BlockResult) -> Result<(), PersistenceError>;

    /// Latest stored snapshot of a job.
    async fn load_job(&self, job_id: &str) -> Result<Job, PersistenceError>;
}
