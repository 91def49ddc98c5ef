//! In-memory job store.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use super::JobStore;
use crate::error::PersistenceError;
use crate::workflow::{BlockResult, Job, WorkflowDefinition};

/// Keeps everything in process memory; lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    jobs: RwLock<HashMap<String, Job>>,
    result_log: RwLock<HashMap<String, Vec<BlockResult>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block results appended for a job, in order.
    pub async fn block_results(&self, job_id: &str) -> Vec<BlockResult> {
        self.result_log.read().await.get(job_id).cloned().unwrap_or_default()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, PersistenceError> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| PersistenceError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), PersistenceError> {
        debug!("Saving workflow '{}' in memory", workflow.id);
        self.workflows.write().await.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn save_job_snapshot(&self, job: &Job) -> Result<(), PersistenceError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn append_block_result(&self, job_id: &str, result: &BlockResult) -> Result<(), PersistenceError> {
        self.result_log
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Job, PersistenceError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{BlockDefinition, BlockKind};

    #[tokio::test]
    async fn test_workflow_roundtrip() {
        let store = MemoryStore::new();
        let workflow = WorkflowDefinition::new("Leads")
            .with_id("wf-1")
            .with_block(BlockDefinition::new("load", "load_table").with_param("file_path", "leads.csv"));
        store.save_workflow(&workflow).await.unwrap();

        let loaded = store.load_workflow("wf-1").await.unwrap();
        assert_eq!(loaded.name, "Leads");
        assert!(matches!(
            store.load_workflow("wf-2").await,
            Err(PersistenceError::WorkflowNotFound(id)) if id == "wf-2"
        ));
    }

    #[tokio::test]
    async fn test_job_snapshots_and_results() {
        let store = MemoryStore::new();
        let mut job = Job::new("wf-1", "Leads", 2);
        store.save_job_snapshot(&job).await.unwrap();

        job.start().unwrap();
        store.save_job_snapshot(&job).await.unwrap();
        assert_eq!(store.job_count().await, 1);
        assert_eq!(store.load_job(&job.id).await.unwrap().status, job.status);

        let result = BlockResult::failed("load", BlockKind::LoadTable, 0, 3, "file not found");
        store.append_block_result(&job.id, &result).await.unwrap();
        assert_eq!(store.block_results(&job.id).await, vec![result]);
        assert!(store.block_results("other").await.is_empty());

        assert!(matches!(store.load_job("nope").await, Err(PersistenceError::JobNotFound(_))));
    }
}
