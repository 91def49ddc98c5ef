//! Workflow Definition Module
//!
//! Data structures and utilities for defining, decoding and validating
//! block workflows.
//!
//! # Structure
//!
//! - [`model`]: Persisted definitions and decoded workflows
//! - [`params`]: Typed per-kind block configuration
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Graph validation and topological ordering
//! - [`planner`]: The ordered execution plan
//! - [`state`]: Job status, progress and block results

pub mod model;
pub mod params;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{Block, BlockDefinition, BlockKind, Connection, DataShape, Workflow, WorkflowDefinition};
pub use params::{BlockConfig, FieldSchema};
pub use parser::{load_and_plan, load_workflow, parse_workflow, save_workflow};
pub use planner::{ExecutionPlan, PlannedStep};
pub use state::{BlockResult, Job, JobResults, JobStatus, Progress};
pub use validator::{quick_validate, validate_definition, validate_workflow, ValidationError};
