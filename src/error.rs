//! Crate-level errors
//!
//! Errors of individual components live next to them (`ValidationError`,
//! `StoreError`, `ServiceError`, `BlockError`). This module holds the
//! errors surfaced by the controller and the persistence collaborator.

use std::io;

use thiserror::Error;

use crate::workflow::ValidationError;

/// Errors raised by a [`JobStore`](crate::persistence::JobStore).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by the job controller and workflow loading.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("failed to read workflow file '{path}': {source}")]
    WorkflowFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse workflow file '{path}': {message}")]
    WorkflowParse { path: String, message: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts() {
        let err: EngineError = ValidationError::EmptyWorkflow.into();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(err.to_string(), "invalid workflow: Workflow has no blocks");
    }

    #[test]
    fn test_persistence_error_display() {
        let err = PersistenceError::WorkflowNotFound("wf-9".to_string());
        let err: EngineError = err.into();
        assert!(err.to_string().contains("wf-9"));
    }
}
