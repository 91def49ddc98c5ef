//! HTTP implementation of the enrichment service.
//!
//! - `POST {base}/enrich-lead` with `{"lead_info": ..., "struct": ...}`
//! - `POST {base}/find-email` with `{"person_info": ..., "struct": ..., "search_mode": ...}`
//! - `GET {base}/health` for status checks
//!
//! Requests authenticate with the `x-api-key` header.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, log, Level};
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde_json::{json, Map, Value};

use super::client::{EnrichmentRequest, EnrichmentService, RequestKind};
use super::error::ServiceError;

pub const DEFAULT_BASE_URL: &str = "https://api.sixtyfour.ai";

/// Log level of a failed call; per-record rejections go to debug.
fn failure_level(err: &ServiceError) -> Level {
    match err {
        ServiceError::Rejected { .. } => Level::Debug,
        _ => Level::Warn,
    }
}

/// Longest error body kept in a `Rejected` message.
const MAX_ERROR_BODY: usize = 300;

pub struct HttpEnrichmentService {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEnrichmentService {
    /// Creates the service. Without an API key every call fails with
    /// [`ServiceError::Auth`].
    pub fn new(base_url: &str, api_key: Option<String>, connect_timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Result<&str, ServiceError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ServiceError::Auth("no API key configured (set ENRICHMENT_API_KEY)".to_string()))
    }

    fn request_body(request: &EnrichmentRequest) -> (&'static str, Value) {
        let record = Value::Object(request.record.clone());
        match request.kind {
            RequestKind::Lead => (
                "enrich-lead",
                json!({
                    "lead_info": record,
                    "struct": request.schema.to_json(),
                }),
            ),
            RequestKind::Contact => (
                "find-email",
                json!({
                    "person_info": record,
                    "struct": request.schema.to_json(),
                    "search_mode": if request.aggressive { "aggressive" } else { "standard" },
                }),
            ),
        }
    }
}

/// Maps a non-success status to a typed error.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ServiceError {
    let mut message: String = body.chars().take(MAX_ERROR_BODY).collect();
    if message.trim().is_empty() {
        message = status.canonical_reason().unwrap_or("no body").to_string();
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::Timeout(Duration::ZERO),
        s if s.is_server_error() => ServiceError::Unavailable(format!("{}: {}", s.as_u16(), message)),
        s => ServiceError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Extracts the found fields from a response body.
///
/// Some responses nest the fields under `structured_data`.
fn extract_fields(body: Value) -> Result<Map<String, Value>, ServiceError> {
    match body {
        Value::Object(mut object) => match object.remove("structured_data") {
            Some(Value::Object(fields)) => Ok(fields),
            Some(other) => {
                object.insert("structured_data".to_string(), other);
                Ok(object)
            }
            None => Ok(object),
        },
        other => Err(ServiceError::MalformedResponse(format!(
            "expected a JSON object, got {}",
            match other {
                Value::Array(_) => "an array",
                Value::String(_) => "a string",
                Value::Number(_) => "a number",
                Value::Bool(_) => "a boolean",
                _ => "null",
            }
        ))),
    }
}

#[async_trait]
impl EnrichmentService for HttpEnrichmentService {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Map<String, Value>, ServiceError> {
        let api_key = self.api_key()?;
        let (endpoint, body) = Self::request_body(request);
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status, wait, &text);
            log!(failure_level(&err), "{} failed: {}", endpoint, err);
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;
        extract_fields(body)
    }

    async fn check_status(&self) -> Result<(), ServiceError> {
        let api_key = self.api_key()?;
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).header("x-api-key", api_key).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let wait = retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status, wait, &text))
        }
    }

    fn name(&self) -> &str {
        "sixtyfour"
    }
}
