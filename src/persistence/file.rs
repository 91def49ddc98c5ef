//! File-backed job store.
//!
//! Layout under the state directory:
//!
//! ```text
//! {state_dir}/workflows/{workflow_id}.json   ids percent-encoded
//! {state_dir}/jobs/{job_id}.json          latest job snapshot
//! {state_dir}/jobs/{job_id}.results.jsonl one block result per line
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::JobStore;
use crate::error::PersistenceError;
use crate::workflow::{BlockResult, Job, WorkflowDefinition};

/// Stores workflows and jobs as JSON files.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.root.join("workflows").join(format!("{}.json", file_stem(workflow_id)))
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{}.json", file_stem(job_id)))
    }

    fn results_path(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{}.results.jsonl", file_stem(job_id)))
    }

    /// Block results appended for a job, in order.
    pub async fn block_results(&self, job_id: &str) -> Result<Vec<BlockResult>, PersistenceError> {
        let content = match fs::read_to_string(self.results_path(job_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PersistenceError::from))
            .collect()
    }
}

/// Encodes an id as a file name. Bytes other than ASCII alphanumerics,
/// `-` and `_` become `%XX`, so distinct ids never share a file.
fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

async fn write_json(path: &Path, json: String) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    // Write then rename so readers never see a partial snapshot
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl JobStore for FileStore {
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, PersistenceError> {
        let path = self.workflow_path(workflow_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PersistenceError::WorkflowNotFound(workflow_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        info!("Loaded workflow '{}' from {}", workflow_id, path.display());
        Ok(serde_json::from_str(&content)?)
    }

    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), PersistenceError> {
        let path = self.workflow_path(&workflow.id);
        write_json(&path, serde_json::to_string_pretty(workflow)?).await?;
        info!("Saved workflow '{}' to {}", workflow.id, path.display());
        Ok(())
    }

    async fn save_job_snapshot(&self, job: &Job) -> Result<(), PersistenceError> {
        let path = self.job_path(&job.id);
        write_json(&path, serde_json::to_string_pretty(job)?).await?;
        debug!("Saved job {} ({}) to {}", job.id, job.status, path.display());
        Ok(())
    }

    async fn append_block_result(&self, job_id: &str, result: &BlockResult) -> Result<(), PersistenceError> {
        let path = self.results_path(job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Job, PersistenceError> {
        match fs::read_to_string(self.job_path(job_id)).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(PersistenceError::JobNotFound(job_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
