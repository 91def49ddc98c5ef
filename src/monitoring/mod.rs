//! Monitoring Module
//!
//! Timing of block execution within a job.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Block start/end events, durations and Gantt charts

pub mod timeline;

pub use timeline::{BlockSpan, EventType, ExecutionTimeline, TimelineEvent};
