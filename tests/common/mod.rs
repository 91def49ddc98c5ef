//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use leadflow::config::Settings;
use leadflow::enrichment::{EnrichmentClient, EnrichmentRequest, EnrichmentService, ServiceError};
use leadflow::persistence::MemoryStore;
use leadflow::{BlockDefinition, JobController, WorkflowDefinition};

/// Enrichment service whose answers depend only on the request.
///
/// Every schema field is filled with `"{field} of {name}"`. Records whose
/// `name` is in the failing set are rejected with a non-retryable error.
pub struct StubService {
    failing: HashSet<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubService {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sleeps this long in every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentService for StubService {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Map<String, Value>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let name = request
            .record
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if self.failing.contains(&name) {
            return Err(ServiceError::Rejected {
                status: 404,
                message: format!("no match for {}", name),
            });
        }

        Ok(request
            .schema
            .names()
            .map(|field| (field.to_string(), Value::String(format!("{} of {}", field, name))))
            .collect())
    }

    async fn check_status(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Writes `count` leads to `path`. Every fifth row and the one after it
/// work at an Acme company, which makes 40 Acme rows out of 100.
pub fn write_leads(path: &Path, count: usize) {
    let mut content = String::from("name,company,city\n");
    for i in 0..count {
        let company = if i % 5 < 2 {
            format!("Acme {}", i)
        } else {
            format!("Globex {}", i)
        };
        content.push_str(&format!("Lead {},{},City {}\n", i, company, i % 7));
    }
    std::fs::write(path, content).unwrap();
}

/// `load -> filter(company contains "Acme") -> enrich -> persist`.
pub fn acme_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("Acme leads")
        .with_id("wf-acme")
        .with_block(BlockDefinition::new("load", "load_table").with_param("file_path", "leads.csv"))
        .with_block(BlockDefinition::new("filter", "filter").with_param("condition", "company contains \"Acme\""))
        .with_block(
            BlockDefinition::new("enrich", "enrich_record")
                .with_param("struct", json!({"email": "Work email", "title": "Job title"}))
                .with_param("columns", json!(["name", "company"])),
        )
        .with_block(BlockDefinition::new("save", "persist_table").with_param("file_path", "out/out.csv"))
        .connect("load", "filter")
        .connect("filter", "enrich")
        .connect("enrich", "save")
}

pub fn settings(data_dir: &Path) -> Settings {
    Settings {
        data_dir: data_dir.to_path_buf(),
        ..Settings::default()
    }
}

pub fn controller(settings: &Settings, service: Arc<StubService>) -> (JobController, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let client = EnrichmentClient::with_defaults(service);
    (JobController::new(settings, Some(client), store.clone()), store)
}

/// Header and rows of a CSV file.
pub fn read_output(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|record| record.unwrap().iter().map(String::from).collect())
        .collect();
    (headers, rows)
}
