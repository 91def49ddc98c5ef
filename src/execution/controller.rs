//! Job Controller
//!
//! Accepts workflows, turns them into jobs and runs each job on its own
//! task. Validation happens synchronously in [`JobController::submit_job`],
//! so an invalid workflow never becomes a job. At most
//! `max_concurrent_jobs` jobs run at once; the rest wait in `pending`
//! and can be cancelled while they wait. Finished jobs stay queryable
//! in memory until [`JobController::cleanup_finished`] drops them; the
//! store still answers for them afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::enrichment::EnrichmentClient;
use crate::error::{EngineError, PersistenceError};
use crate::persistence::JobStore;
use crate::workflow::{validate_definition, Job, JobResults, JobStatus, WorkflowDefinition};

use super::engine::Engine;

struct JobHandle {
    updates: watch::Receiver<Job>,
    cancel: CancellationToken,
}

/// Counts of the jobs a controller currently tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Concurrency slots not held by a running job
    pub available_slots: usize,
}

/// Runs jobs and answers questions about them.
pub struct JobController {
    jobs: Mutex<HashMap<String, JobHandle>>,
    slots: Arc<Semaphore>,
    client: Option<EnrichmentClient>,
    persistence: Arc<dyn JobStore>,
    data_dir: PathBuf,
    store_budget: usize,
    preview_rows: usize,
}

impl JobController {
    /// Creates a controller. `client` is shared by every job; without one,
    /// enrichment blocks fail.
    pub fn new(settings: &Settings, client: Option<EnrichmentClient>, persistence: Arc<dyn JobStore>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            client,
            persistence,
            data_dir: settings.data_dir.clone(),
            store_budget: settings.store_budget_bytes,
            preview_rows: settings.preview_rows,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validates `definition` and starts a job for it. Returns the job id.
    pub async fn submit_job(&self, definition: WorkflowDefinition) -> Result<String, EngineError> {
        let (_, plan) = validate_definition(&definition)?;
        let job = Job::new(&plan.workflow_id, &plan.workflow_name, plan.len());
        let job_id = job.id.clone();

        if let Err(e) = self.persistence.save_workflow(&definition).await {
            warn!("Failed to persist workflow '{}': {}", definition.id, e);
        }
        if let Err(e) = self.persistence.save_job_snapshot(&job).await {
            warn!("Failed to persist job {}: {}", job_id, e);
        }

        let mut engine = Engine::new(plan);
        engine.set_data_dir(&self.data_dir);
        engine.set_store_budget(self.store_budget);
        engine.set_preview_rows(self.preview_rows);
        engine.set_persistence(Arc::clone(&self.persistence));
        if let Some(client) = &self.client {
            engine.set_client(client.clone());
        }

        let (sender, receiver) = watch::channel(job.clone());
        let cancel = CancellationToken::new();
        self.jobs().insert(
            job_id.clone(),
            JobHandle {
                updates: receiver,
                cancel: cancel.clone(),
            },
        );

        info!("Submitted job {} for workflow '{}'", job_id, definition.name);

        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = slots.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            if permit.is_none() && !cancel.is_cancelled() {
                warn!("Job {} is running without a concurrency slot", job.id);
            }
            engine.run(job, &sender, &cancel).await;
            drop(permit);
        });

        Ok(job_id)
    }

    /// Loads a stored workflow and submits it.
    pub async fn submit_workflow(&self, workflow_id: &str) -> Result<String, EngineError> {
        let definition = self.persistence.load_workflow(workflow_id).await?;
        self.submit_job(definition).await
    }

    /// Latest snapshot of a job.
    pub async fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let live = self.jobs().get(job_id).map(|handle| handle.updates.borrow().clone());
        match live {
            Some(job) => Ok(job),
            None => self.persistence.load_job(job_id).await.map_err(|e| match e {
                PersistenceError::JobNotFound(id) => EngineError::JobNotFound(id),
                other => other.into(),
            }),
        }
    }

    /// Requests cancellation. Returns false when the job is unknown or
    /// already finished.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let jobs = self.jobs();
        let Some(handle) = jobs.get(job_id) else {
            return false;
        };
        if handle.updates.borrow().is_terminal() {
            return false;
        }
        info!("Cancellation requested for job {}", job_id);
        handle.cancel.cancel();
        true
    }

    pub async fn get_job_results(&self, job_id: &str) -> Result<JobResults, EngineError> {
        Ok(self.get_job(job_id).await?.results_summary())
    }

    /// Waits until the job reaches a terminal state and returns it.
    pub async fn wait_for(&self, job_id: &str) -> Result<Job, EngineError> {
        let receiver = self.jobs().get(job_id).map(|handle| handle.updates.clone());
        let Some(mut receiver) = receiver else {
            return self.get_job(job_id).await;
        };

        let finished = receiver.wait_for(|job| job.is_terminal()).await.map(|job| job.clone());
        match finished {
            Ok(job) => Ok(job),
            // The job task is gone; report what it last published
            Err(_) => Ok(receiver.borrow().clone()),
        }
    }

    /// Jobs known to this controller, oldest first, optionally filtered by
    /// workflow and status.
    pub fn list_jobs(&self, workflow_id: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs()
            .values()
            .map(|handle| handle.updates.borrow().clone())
            .filter(|job| workflow_id.map_or(true, |id| job.workflow_id == id))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Forgets finished jobs that completed more than `older_than` ago.
    /// Returns how many were dropped.
    pub fn cleanup_finished(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, handle| {
            let job = handle.updates.borrow();
            if !job.is_terminal() {
                return true;
            }
            job.completed_at.unwrap_or(job.created_at) > cutoff
        });
        let removed = before - jobs.len();
        if removed > 0 {
            debug!("Dropped {} finished job(s) from memory", removed);
        }
        removed
    }

    pub fn stats(&self) -> ControllerStats {
        let mut stats = ControllerStats {
            available_slots: self.slots.available_permits(),
            ..ControllerStats::default()
        };
        for handle in self.jobs().values() {
            match handle.updates.borrow().status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::workflow::{BlockDefinition, ValidationError};

    fn controller(dir: &std::path::Path) -> (JobController, Arc<MemoryStore>) {
        let settings = Settings {
            data_dir: dir.to_path_buf(),
            ..Settings::default()
        };
        let store = Arc::new(MemoryStore::new());
        (JobController::new(&settings, None, store.clone()), store)
    }

    fn copy_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("Copy")
            .with_id("wf-copy")
            .with_block(BlockDefinition::new("load", "load_table").with_param("file_path", "in.csv"))
            .with_block(BlockDefinition::new("save", "persist_table").with_param("file_path", "out/out.csv"))
            .connect("load", "save")
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.csv"), "name\nAda\nGrace\n").unwrap();
        let (controller, store) = controller(dir.path());

        let job_id = controller.submit_job(copy_workflow()).await.unwrap();
        let job = controller.wait_for(&job_id).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results.len(), 2);
        assert!(job.final_output_path.as_deref().unwrap().ends_with("out/out.csv"));
        assert!(dir.path().join("out/out.csv").exists());

        let results = controller.get_job_results(&job_id).await.unwrap();
        assert_eq!(results.status, JobStatus::Completed);
        assert_eq!(results.results[0].rows_out, 2);

        assert_eq!(store.block_results(&job_id).await.len(), 2);
        assert_eq!(store.load_job(&job_id).await.unwrap().status, JobStatus::Completed);
        assert!(!controller.cancel_job(&job_id));
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, store) = controller(dir.path());

        let definition = copy_workflow().connect("save", "load");
        let err = controller.submit_job(definition).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::GraphCycle { .. })));
        assert!(controller.list_jobs(None, None).is_empty());
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_job() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _) = controller(dir.path());

        let job_id = controller.submit_job(copy_workflow()).await.unwrap();
        let job = controller.wait_for(&job_id).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.results.len(), 1);
        assert!(!job.results[0].success);
        assert!(job.error_message.unwrap().contains("file not found"));

        assert_eq!(controller.list_jobs(None, Some(JobStatus::Failed)).len(), 1);
        assert!(controller.list_jobs(None, Some(JobStatus::Completed)).is_empty());
    }

    #[tokio::test]
    async fn test_submit_stored_workflow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.csv"), "name\nAda\n").unwrap();
        let (controller, store) = controller(dir.path());
        store.save_workflow(&copy_workflow()).await.unwrap();

        let job_id = controller.submit_workflow("wf-copy").await.unwrap();
        assert_eq!(controller.wait_for(&job_id).await.unwrap().status, JobStatus::Completed);

        assert!(matches!(
            controller.submit_workflow("missing").await,
            Err(EngineError::Persistence(PersistenceError::WorkflowNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_list_by_workflow_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.csv"), "name\nAda\n").unwrap();
        let (controller, _) = controller(dir.path());

        let first = controller.submit_job(copy_workflow()).await.unwrap();
        let other = copy_workflow().with_id("wf-other");
        let second = controller.submit_job(other).await.unwrap();
        controller.wait_for(&first).await.unwrap();
        controller.wait_for(&second).await.unwrap();

        let copies = controller.list_jobs(Some("wf-copy"), None);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].id, first);
        assert_eq!(controller.list_jobs(Some("wf-other"), Some(JobStatus::Completed)).len(), 1);
        assert!(controller.list_jobs(Some("wf-missing"), None).is_empty());

        let stats = controller.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.running + stats.pending, 0);
        assert_eq!(stats.available_slots, Settings::default().max_concurrent_jobs);

        // Recently finished jobs are kept
        assert_eq!(controller.cleanup_finished(chrono::Duration::hours(1)), 0);
        assert_eq!(controller.cleanup_finished(chrono::Duration::zero()), 2);
        assert!(controller.list_jobs(None, None).is_empty());
        assert_eq!(controller.stats().completed, 0);

        // The store still answers for dropped jobs
        assert_eq!(controller.get_job(&first).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _) = controller(dir.path());

        assert!(matches!(controller.get_job("nope").await, Err(EngineError::JobNotFound(_))));
        assert!(matches!(controller.wait_for("nope").await, Err(EngineError::JobNotFound(_))));
        assert!(!controller.cancel_job("nope"));
    }
}
