//! Runtime Configuration
//!
//! Settings are read from environment variables, with defaults for
//! anything unset. Values that fail to parse are reported and replaced by
//! their default rather than aborting startup. Command-line flags override
//! individual fields after loading.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::enrichment::http::DEFAULT_BASE_URL;
use crate::enrichment::{
    BreakerConfig, CircuitBreaker, ClientPolicy, EnrichmentClient, HttpEnrichmentService, RateLimiter, ServiceError,
};

const MB: usize = 1024 * 1024;

/// Settings of the enrichment service client.
#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub call_timeout: Duration,
    pub lookup_timeout: Duration,
    /// Calls per second across all jobs; 0 disables limiting
    pub rate_per_sec: f64,
    pub burst: u32,
    pub max_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub breaker_max_wait: Duration,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        let policy = ClientPolicy::default();
        let breaker = BreakerConfig::default();
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            call_timeout: policy.call_timeout,
            lookup_timeout: policy.lookup_timeout,
            rate_per_sec: 10.0,
            burst: 10,
            max_retries: policy.max_retries,
            breaker_threshold: breaker.failure_threshold,
            breaker_cooldown: breaker.cooldown,
            breaker_max_wait: policy.breaker_max_wait,
        }
    }
}

impl EnrichmentSettings {
    /// Builds the process-wide client shared by every job.
    pub fn build_client(&self) -> Result<EnrichmentClient, ServiceError> {
        let service = HttpEnrichmentService::new(&self.base_url, self.api_key.clone(), self.lookup_timeout)?;
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: self.breaker_threshold,
            cooldown: self.breaker_cooldown,
            ..BreakerConfig::default()
        });
        let policy = ClientPolicy {
            call_timeout: self.call_timeout,
            lookup_timeout: self.lookup_timeout,
            max_retries: self.max_retries,
            breaker_max_wait: self.breaker_max_wait,
            ..ClientPolicy::default()
        };

        Ok(EnrichmentClient::new(
            Arc::new(service),
            Arc::new(RateLimiter::new(self.rate_per_sec, self.burst)),
            Arc::new(breaker),
            policy,
        ))
    }
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory relative block file paths resolve against
    pub data_dir: PathBuf,
    /// Directory of the file-backed job store
    pub state_dir: PathBuf,
    /// Byte budget of each job's table store
    pub store_budget_bytes: usize,
    pub max_concurrent_jobs: usize,
    /// Rows kept in each block result preview
    pub preview_rows: usize,
    pub enrichment: EnrichmentSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./uploads"),
            state_dir: PathBuf::from(".leadflow"),
            store_budget_bytes: 256 * MB,
            max_concurrent_jobs: 5,
            preview_rows: 5,
            enrichment: EnrichmentSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads settings through `lookup`, which returns the raw value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let enrichment = defaults.enrichment.clone();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let secs = |name: &str, default: Duration| Duration::from_secs(parse_or(var(name), name, default.as_secs()));

        Self {
            data_dir: var("LEADFLOW_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            state_dir: var("LEADFLOW_STATE_DIR").map(PathBuf::from).unwrap_or(defaults.state_dir),
            store_budget_bytes: parse_or(
                var("LEADFLOW_STORE_BUDGET_MB"),
                "LEADFLOW_STORE_BUDGET_MB",
                defaults.store_budget_bytes / MB,
            )
            .saturating_mul(MB),
            max_concurrent_jobs: parse_or(
                var("LEADFLOW_MAX_CONCURRENT_JOBS"),
                "LEADFLOW_MAX_CONCURRENT_JOBS",
                defaults.max_concurrent_jobs,
            )
            .max(1),
            preview_rows: parse_or(var("LEADFLOW_PREVIEW_ROWS"), "LEADFLOW_PREVIEW_ROWS", defaults.preview_rows),
            enrichment: EnrichmentSettings {
                api_key: var("ENRICHMENT_API_KEY"),
                base_url: var("ENRICHMENT_BASE_URL").unwrap_or(enrichment.base_url),
                call_timeout: secs("ENRICHMENT_CALL_TIMEOUT_SECS", enrichment.call_timeout),
                lookup_timeout: secs("ENRICHMENT_LOOKUP_TIMEOUT_SECS", enrichment.lookup_timeout),
                rate_per_sec: parse_or(var("ENRICHMENT_RATE_PER_SEC"), "ENRICHMENT_RATE_PER_SEC", enrichment.rate_per_sec),
                burst: parse_or(var("ENRICHMENT_BURST"), "ENRICHMENT_BURST", enrichment.burst),
                max_retries: parse_or(var("ENRICHMENT_MAX_RETRIES"), "ENRICHMENT_MAX_RETRIES", enrichment.max_retries),
                breaker_threshold: parse_or(
                    var("ENRICHMENT_BREAKER_THRESHOLD"),
                    "ENRICHMENT_BREAKER_THRESHOLD",
                    enrichment.breaker_threshold,
                ),
                breaker_cooldown: secs("ENRICHMENT_BREAKER_COOLDOWN_SECS", enrichment.breaker_cooldown),
                breaker_max_wait: secs("ENRICHMENT_BREAKER_MAX_WAIT_SECS", enrichment.breaker_max_wait),
            },
        }
    }
}

/// Parses `raw`, falling back to `default` with a warning on bad input.
fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match raw {
        None => default,
        Some(value) => match value.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Ignoring {}='{}' ({}); using default {}", name, value, e, default);
                default
            }
        },
    }
}
