//! LeadFlow - Block Workflow Engine for Lead Enrichment
//!
//! Runs user-built pipelines of blocks over tabular lead data: load a
//! file, filter rows, enrich each record through an external service,
//! and write the result back out.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow definitions, validation, planning and job state
//! - [`data`]: Intermediate tables and the per-job table store
//! - [`execution`]: Job controller, pipeline scheduler and block executors
//! - [`enrichment`]: Batched, rate-limited calls to the enrichment service
//! - [`persistence`]: Storage of workflows and job records
//! - [`monitoring`]: Block execution timeline
//! - [`config`]: Environment-driven settings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use leadflow::config::Settings;
//! use leadflow::persistence::FileStore;
//! use leadflow::{load_workflow, JobController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env();
//!     let client = settings.enrichment.build_client()?;
//!     let store = Arc::new(FileStore::new(&settings.state_dir));
//!     let controller = JobController::new(&settings, Some(client), store);
//!
//!     let workflow = load_workflow("leads.yaml")?;
//!     let job_id = controller.submit_job(workflow).await?;
//!     let job = controller.wait_for(&job_id).await?;
//!     println!("{}: {:?}", job.status, job.final_output_path);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data;
pub mod enrichment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod persistence;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, PersistenceError};
pub use execution::{ControllerStats, Engine, JobController};
pub use workflow::model::{BlockDefinition, Workflow, WorkflowDefinition};
pub use workflow::parser::{load_and_plan, load_workflow};
pub use workflow::state::{Job, JobResults, JobStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "LeadFlow";
