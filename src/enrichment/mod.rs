//! Enrichment Module
//!
//! Access to the external enrichment service.
//!
//! - [`client`]: Batched, retried, concurrent calls and the service trait
//! - [`limiter`]: Shared token-bucket rate limiter
//! - [`breaker`]: Shared circuit breaker
//! - [`http`]: The HTTP service implementation
//! - [`error`]: Per-call and per-batch errors

pub mod breaker;
pub mod client;
pub mod error;
pub mod http;
pub mod limiter;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use client::{
    BatchOptions, ClientPolicy, EnrichmentClient, EnrichmentRequest, EnrichmentService, RecordOutcome,
    RequestKind,
};
pub use error::{EnrichmentError, ServiceError};
pub use http::HttpEnrichmentService;
pub use limiter::RateLimiter;
