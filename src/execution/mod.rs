//! Workflow Execution Module
//!
//! Runs validated workflows as jobs.
//!
//! # Architecture
//!
//! - [`controller`]: Job submission, admission, cancellation and queries
//! - [`engine`]: The per-job pipeline scheduler
//! - [`step`]: The block executor contract
//! - [`blocks`]: One executor per block kind
//! - [`predicate`]: The filter condition language

pub mod blocks;
pub mod controller;
pub mod engine;
pub mod predicate;
pub mod step;

pub use controller::{ControllerStats, JobController};
pub use engine::Engine;
pub use predicate::{Predicate, PredicateError};
pub use step::{BlockContext, BlockError, BlockExecutor, BlockOutput};
