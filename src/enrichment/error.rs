//! Enrichment errors
//!
//! [`ServiceError`] classifies a single failed call to the external
//! service. [`EnrichmentError`] is what aborts a whole batch.

use std::time::Duration;

use thiserror::Error;

/// Failure of one call to the enrichment service.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by service")]
    RateLimited {
        /// Delay requested by the service, if it sent one
        retry_after: Option<Duration>,
    },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ServiceError {
    /// Whether the call may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited { .. } | ServiceError::Timeout(_) | ServiceError::Unavailable(_)
        )
    }

    /// Whether the failure says something about the health of the service
    /// itself, as opposed to the individual request.
    pub fn is_service_failure(&self) -> bool {
        matches!(self, ServiceError::Timeout(_) | ServiceError::Unavailable(_))
    }

    /// Delay the service asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ServiceError::MalformedResponse(err.to_string())
        } else {
            ServiceError::Unavailable(err.to_string())
        }
    }
}

/// Failure that aborts an enrichment batch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnrichmentError {
    #[error("enrichment service circuit held open for {waited:?}; giving up")]
    CircuitOpen { waited: Duration },

    #[error("enrichment cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ServiceError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ServiceError::Unavailable("502".to_string()).is_retryable());
        assert!(ServiceError::RateLimited { retry_after: None }.is_retryable());

        assert!(!ServiceError::Auth("bad key".to_string()).is_retryable());
        assert!(!ServiceError::MalformedResponse("not json".to_string()).is_retryable());
        assert!(!ServiceError::Rejected {
            status: 422,
            message: "bad lead".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_service_failure_classification() {
        assert!(ServiceError::Timeout(Duration::from_secs(1)).is_service_failure());
        assert!(!ServiceError::RateLimited { retry_after: None }.is_service_failure());
        assert!(!ServiceError::Auth(String::new()).is_service_failure());
    }

    #[test]
    fn test_retry_after() {
        let err = ServiceError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(ServiceError::Timeout(Duration::ZERO).retry_after(), None);
    }
}
