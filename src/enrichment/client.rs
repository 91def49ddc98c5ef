//! Enrichment Client
//!
//! Drives batched, concurrent calls to an [`EnrichmentService`]:
//! - Records are split into batches; each record of a batch is its own
//!   concurrent call and the batch is joined before the next is sent
//! - Every call passes the shared rate limiter and circuit breaker
//! - Retryable failures are retried with exponential backoff
//! - Each record gets its own outcome, so partial success is normal
//!
//! One client is built per process and cloned into every job, so all
//! jobs share the same limiter and breaker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use super::error::{EnrichmentError, ServiceError};
use super::limiter::RateLimiter;
use crate::workflow::params::FieldSchema;

/// What the service is asked to do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Fill arbitrary fields about a lead
    Lead,
    /// Locate a contact email for a person
    Contact,
}

/// One call to the enrichment service.
#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub kind: RequestKind,
    /// Known fields of the record, empty values omitted
    pub record: Map<String, Value>,
    pub schema: FieldSchema,
    /// Ask the service to search harder (contact lookups)
    pub aggressive: bool,
}

/// The external enrichment service.
///
/// Implementations return the fields they found for one record. Fields
/// absent from the response are left empty by the caller.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Map<String, Value>, ServiceError>;

    /// Cheap status check used before long runs.
    async fn check_status(&self) -> Result<(), ServiceError>;

    fn name(&self) -> &str {
        "enrichment"
    }
}

/// Outcome of one record: the fields found, or why it failed.
pub type RecordOutcome = Result<Map<String, Value>, ServiceError>;

/// Timeouts, retry and breaker-wait limits for the client.
#[derive(Debug, Clone)]
pub struct ClientPolicy {
    /// Timeout of one enrichment call
    pub call_timeout: Duration,
    /// Timeout of status checks
    pub lookup_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total time one call may spend waiting on an open breaker. Waiting
    /// behind an in-flight half-open trial call is not counted.
    pub breaker_max_wait: Duration,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            lookup_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            breaker_max_wait: Duration::from_secs(120),
        }
    }
}

impl ClientPolicy {
    /// Delay before retry number `attempt` (1-based), never above `max_backoff`.
    pub fn backoff(&self, err: &ServiceError, attempt: u32) -> Duration {
        if let Some(delay) = err.retry_after() {
            return delay.min(self.max_backoff);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Per-block batch settings.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub kind: RequestKind,
    pub batch_size: usize,
    /// Overrides the policy's call timeout
    pub timeout: Option<Duration>,
    pub aggressive: bool,
}

impl BatchOptions {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            batch_size: 10,
            timeout: None,
            aggressive: false,
        }
    }
}

enum CallFailure {
    Service(ServiceError),
    CircuitOpen(Duration),
}

#[derive(Clone)]
pub struct EnrichmentClient {
    service: Arc<dyn EnrichmentService>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    policy: ClientPolicy,
}

impl EnrichmentClient {
    pub fn new(
        service: Arc<dyn EnrichmentService>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        policy: ClientPolicy,
    ) -> Self {
        Self {
            service,
            limiter,
            breaker,
            policy,
        }
    }

    /// Client with no rate limit and a default breaker, mostly for tests.
    pub fn with_defaults(service: Arc<dyn EnrichmentService>) -> Self {
        Self::new(
            service,
            Arc::new(RateLimiter::unlimited()),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            ClientPolicy::default(),
        )
    }

    pub fn policy(&self) -> &ClientPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Checks that the service is reachable, bounded by the lookup timeout.
    pub async fn check_service(&self) -> Result<(), ServiceError> {
        let timeout = self.policy.lookup_timeout;
        match tokio::time::timeout(timeout, self.service.check_status()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(timeout)),
        }
    }

    /// Enriches `records`, returning one outcome per record in input order.
    ///
    /// Fails as a whole only when cancelled between batches or when a call
    /// has waited on an open circuit longer than the policy allows.
    pub async fn enrich_batch(
        &self,
        records: Vec<Map<String, Value>>,
        schema: &FieldSchema,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecordOutcome>, EnrichmentError> {
        self.enrich_batch_reporting(records, schema, options, cancel, &|_| {}).await
    }

    /// Like [`EnrichmentClient::enrich_batch`], calling `report` with the
    /// number of records handled after each batch.
    pub async fn enrich_batch_reporting(
        &self,
        records: Vec<Map<String, Value>>,
        schema: &FieldSchema,
        options: &BatchOptions,
        cancel: &CancellationToken,
        report: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<Vec<RecordOutcome>, EnrichmentError> {
        let batch_size = options.batch_size.max(1);
        let timeout = options.timeout.unwrap_or(self.policy.call_timeout);
        let total = records.len();
        let batches = (total + batch_size - 1) / batch_size;
        let mut outcomes = Vec::with_capacity(total);

        let mut pending = records.into_iter().peekable();
        let mut batch_number = 0;
        while pending.peek().is_some() {
            if cancel.is_cancelled() {
                info!("Enrichment cancelled before batch {}/{}", batch_number + 1, batches);
                return Err(EnrichmentError::Cancelled);
            }
            batch_number += 1;

            let requests: Vec<EnrichmentRequest> = pending
                .by_ref()
                .take(batch_size)
                .map(|record| EnrichmentRequest {
                    kind: options.kind,
                    record,
                    schema: schema.clone(),
                    aggressive: options.aggressive,
                })
                .collect();

            debug!(
                "Dispatching batch {}/{} ({} records) to {}",
                batch_number,
                batches,
                requests.len(),
                self.service.name()
            );

            let results = join_all(requests.iter().map(|request| self.call_with_retry(request, timeout))).await;

            let mut failed = 0;
            for result in results {
                match result {
                    Ok(fields) => outcomes.push(Ok(fields)),
                    Err(CallFailure::Service(err)) => {
                        failed += 1;
                        outcomes.push(Err(err));
                    }
                    Err(CallFailure::CircuitOpen(waited)) => {
                        return Err(EnrichmentError::CircuitOpen { waited });
                    }
                }
            }

            info!(
                "Batch {}/{} done: {} succeeded, {} failed",
                batch_number,
                batches,
                requests.len() - failed,
                failed
            );
            report(outcomes.len());
        }

        Ok(outcomes)
    }

    async fn call_with_retry(&self, request: &EnrichmentRequest, timeout: Duration) -> Result<Map<String, Value>, CallFailure> {
        let mut attempt: u32 = 0;
        let mut waited = Duration::ZERO;

        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(rejection) if rejection.state == CircuitState::HalfOpen => {
                    // Another call holds the trial slot; its outcome decides
                    tokio::time::sleep(rejection.retry_in).await;
                    continue;
                }
                Err(rejection) => {
                    if waited >= self.policy.breaker_max_wait {
                        return Err(CallFailure::CircuitOpen(waited));
                    }
                    let pause = rejection
                        .retry_in
                        .min(self.policy.breaker_max_wait - waited)
                        .max(Duration::from_millis(1));
                    debug!("Circuit {}; waiting {:?}", rejection.state, pause);
                    tokio::time::sleep(pause).await;
                    waited += pause;
                    continue;
                }
            };

            self.limiter.acquire().await;

            let result = match tokio::time::timeout(timeout, self.service.enrich(request)).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(timeout)),
            };

            let err = match result {
                Ok(fields) => {
                    self.breaker.on_success(permit);
                    return Ok(fields);
                }
                Err(err) => err,
            };

            if err.is_service_failure() {
                self.breaker.on_failure(permit);
            } else {
                self.breaker.on_success(permit);
            }

            if !err.is_retryable() || attempt >= self.policy.max_retries {
                warn!("Enrichment call failed after {} attempt(s): {}", attempt + 1, err);
                return Err(CallFailure::Service(err));
            }

            attempt += 1;
            let delay = self.policy.backoff(&err, attempt);
            debug!("Retrying enrichment call in {:?} (attempt {}): {}", delay, attempt, err);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replies per record name with a queue of scripted results.
    struct ScriptedService {
        scripts: Mutex<HashMap<String, Vec<Result<Map<String, Value>, ServiceError>>>>,
        delays: HashMap<String, Duration>,
        calls: AtomicUsize,
    }

    impl ScriptedService {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                delays: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, name: &str, delay: Duration) -> Self {
            self.delays.insert(name.to_string(), delay);
            self
        }

        fn script(self, name: &str, results: Vec<Result<Map<String, Value>, ServiceError>>) -> Self {
            self.scripts.lock().unwrap().insert(name.to_string(), results);
            self
        }
    }

    #[async_trait]
    impl EnrichmentService for ScriptedService {
        async fn enrich(&self, request: &EnrichmentRequest) -> Result<Map<String, Value>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = request.record.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if let Some(delay) = self.delays.get(&name) {
                tokio::time::sleep(*delay).await;
            }
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&name) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(found(&name)),
            }
        }

        async fn check_status(&self) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn found(name: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("title".to_string(), Value::String(format!("CTO of {}", name)));
        fields
    }

    fn record(name: &str) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("name".to_string(), Value::String(name.to_string()));
        record
    }

    fn schema() -> FieldSchema {
        FieldSchema::new([("title", "Job title")])
    }

    fn client(service: ScriptedService, policy: ClientPolicy) -> (EnrichmentClient, Arc<ScriptedService>) {
        let service = Arc::new(service);
        let client = EnrichmentClient::new(
            service.clone(),
            Arc::new(RateLimiter::unlimited()),
            Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(5),
            })),
            policy,
        );
        (client, service)
    }

    fn options(batch_size: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            ..BatchOptions::new(RequestKind::Lead)
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = ClientPolicy::default();
        let err = ServiceError::Unavailable("503".to_string());
        assert_eq!(policy.backoff(&err, 1), Duration::from_millis(500));
        assert_eq!(policy.backoff(&err, 2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(&err, 3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(&err, 10), Duration::from_secs(10));

        let limited = ServiceError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.backoff(&limited, 1), Duration::from_secs(7));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = ClientPolicy::default();
        let limited = ServiceError::RateLimited {
            retry_after: Some(Duration::from_secs(86_400)),
        };
        assert_eq!(policy.backoff(&limited, 1), policy.max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_in_input_order() {
        let (client, service) = client(ScriptedService::new(), ClientPolicy::default());
        let records = (0..25).map(|i| record(&format!("lead{}", i))).collect();

        let outcomes = client
            .enrich_batch(records, &schema(), &options(10), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 25);
        assert_eq!(outcomes[7].as_ref().unwrap()["title"], "CTO of lead7");
        assert_eq!(outcomes[24].as_ref().unwrap()["title"], "CTO of lead24");
        assert_eq!(service.calls.load(Ordering::SeqCst), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_after_each_batch() {
        let (client, _service) = client(ScriptedService::new(), ClientPolicy::default());
        let records = (0..25).map(|i| record(&format!("lead{}", i))).collect();
        let reported = Mutex::new(Vec::new());

        client
            .enrich_batch_reporting(records, &schema(), &options(10), &CancellationToken::new(), &|done| {
                reported.lock().unwrap().push(done)
            })
            .await
            .unwrap();

        assert_eq!(*reported.lock().unwrap(), vec![10, 20, 25]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_recovers() {
        let service = ScriptedService::new().script(
            "flaky",
            vec![Err(ServiceError::Timeout(Duration::from_secs(1))), Ok(found("flaky"))],
        );
        let (client, service) = client(service, ClientPolicy::default());

        let outcomes = client
            .enrich_batch(vec![record("flaky")], &schema(), &options(10), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcomes[0].is_ok());
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_is_per_record() {
        let service = ScriptedService::new().script(
            "bad",
            vec![Err(ServiceError::Rejected {
                status: 422,
                message: "unprocessable".to_string(),
            })],
        );
        let (client, service) = client(service, ClientPolicy::default());

        let outcomes = client
            .enrich_batch(
                vec![record("good"), record("bad"), record("also good")],
                &schema(),
                &options(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(ServiceError::Rejected { status: 422, .. })));
        assert!(outcomes[2].is_ok());
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let unavailable = || Err(ServiceError::Unavailable("503".to_string()));
        let service = ScriptedService::new().script("down", vec![unavailable(), unavailable(), unavailable()]);
        let policy = ClientPolicy {
            max_retries: 2,
            ..ClientPolicy::default()
        };
        let (client, service) = client(service, policy);

        let outcomes = client
            .enrich_batch(vec![record("down")], &schema(), &options(10), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcomes[0], Err(ServiceError::Unavailable(_))));
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_batch() {
        let (client, service) = client(ScriptedService::new(), ClientPolicy::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client
            .enrich_batch(vec![record("a")], &schema(), &options(10), &cancel)
            .await;

        assert_eq!(result.unwrap_err(), EnrichmentError::Cancelled);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_past_max_wait_fails_batch() {
        let timeout = || Err(ServiceError::Timeout(Duration::from_secs(1)));
        let service = ScriptedService::new()
            .script("a", vec![timeout()])
            .script("b", vec![timeout()])
            .script("c", vec![timeout()]);
        let policy = ClientPolicy {
            max_retries: 0,
            breaker_max_wait: Duration::from_secs(2),
            ..ClientPolicy::default()
        };
        let (client, _service) = client(service, policy);

        // First batch trips the breaker, second batch cannot get through
        let records = vec![record("a"), record("b"), record("c"), record("d")];
        let result = client
            .enrich_batch(records, &schema(), &options(3), &CancellationToken::new())
            .await;

        assert_eq!(
            result.unwrap_err(),
            EnrichmentError::CircuitOpen {
                waited: Duration::from_secs(2)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_short_cooldown() {
        let timeout = || Err(ServiceError::Timeout(Duration::from_secs(1)));
        let service = ScriptedService::new()
            .script("a", vec![timeout()])
            .script("b", vec![timeout()])
            .script("c", vec![timeout()]);
        let policy = ClientPolicy {
            max_retries: 0,
            ..ClientPolicy::default()
        };
        let (client, _service) = client(service, policy);

        let records = vec![record("a"), record("b"), record("c"), record("d")];
        let outcomes = client
            .enrich_batch(records, &schema(), &options(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 3);
        assert!(outcomes[3].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_half_open_call_does_not_fail_batch() {
        let timeout = || Err(ServiceError::Timeout(Duration::from_secs(1)));
        let service = ScriptedService::new()
            .script("a", vec![timeout()])
            .script("b", vec![timeout()])
            .script("c", vec![timeout()])
            .slow("d", Duration::from_secs(100))
            .slow("e", Duration::from_secs(100))
            .slow("f", Duration::from_secs(100));
        let policy = ClientPolicy {
            max_retries: 0,
            breaker_max_wait: Duration::from_secs(30),
            ..ClientPolicy::default()
        };
        let (client, _service) = client(service, policy);

        // Second batch waits out the cooldown, then two calls queue behind a 100s trial call
        let records = vec![record("a"), record("b"), record("c"), record("d"), record("e"), record("f")];
        let outcomes = client
            .enrich_batch(records, &schema(), &options(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 3);
        assert!(outcomes[3..].iter().all(|o| o.is_ok()));
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_service() {
        let (client, _service) = client(ScriptedService::new(), ClientPolicy::default());
        assert!(client.check_service().await.is_ok());
    }
}
