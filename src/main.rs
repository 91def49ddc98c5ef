//! LeadFlow CLI Entry Point
//!
//! Runs a workflow definition file as a job.
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow
//! leadflow leads.yaml
//!
//! # Validate and print the execution plan only
//! leadflow leads.yaml --dry-run
//!
//! # Read and write files under another directory
//! leadflow leads.json --data-dir /data/uploads
//!
//! # Check that the enrichment service is reachable
//! leadflow --check-service
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use leadflow::config::Settings;
use leadflow::persistence::FileStore;
use leadflow::{load_and_plan, Job, JobController, JobStatus, APP_NAME, VERSION};

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    dry_run: bool,
    data_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    store_budget_mb: Option<usize>,
    check_service: bool,
    verbose: bool,
}

/// What the arguments ask for.
enum Command {
    Run(Config),
    Help,
    Version,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Lead enrichment workflow engine");
    println!();
}

fn print_usage() {
    println!("Usage: leadflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>        Workflow definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --dry-run              Validate and print the execution plan");
    println!("  --data-dir PATH        Directory block file paths resolve against");
    println!("  --state-dir PATH       Directory for job and workflow records");
    println!("  --store-budget-mb N    Memory budget for intermediate tables");
    println!("  --check-service        Check that the enrichment service is reachable");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Environment:");
    println!("  ENRICHMENT_API_KEY     API key of the enrichment service");
    println!("  LEADFLOW_DATA_DIR, LEADFLOW_STATE_DIR, LEADFLOW_STORE_BUDGET_MB, ...");
}

fn parse_arguments(args: &[String]) -> Result<Command, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value = |i: usize, flag: &str| -> Result<&String, String> {
        args.get(i).ok_or_else(|| format!("{} requires a value", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-V" => return Ok(Command::Version),
            "--dry-run" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--check-service" => config.check_service = true,
            "--data-dir" => {
                i += 1;
                config.data_dir = Some(PathBuf::from(value(i, "--data-dir")?));
            }
            "--state-dir" => {
                i += 1;
                config.state_dir = Some(PathBuf::from(value(i, "--state-dir")?));
            }
            "--store-budget-mb" => {
                i += 1;
                let raw = value(i, "--store-budget-mb")?;
                let mb: usize = raw.parse().map_err(|_| format!("Invalid store budget: {}", raw))?;
                if mb == 0 {
                    return Err("--store-budget-mb must be at least 1".to_string());
                }
                config.store_budget_mb = Some(mb);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.workflow_path.is_none() && !config.check_service {
        return Err("No workflow file given".to_string());
    }
    Ok(Command::Run(config))
}

fn apply_overrides(settings: &mut Settings, config: &Config) {
    if let Some(dir) = &config.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(dir) = &config.state_dir {
        settings.state_dir = dir.clone();
    }
    if let Some(mb) = config.store_budget_mb {
        settings.store_budget_bytes = mb.saturating_mul(1024 * 1024);
    }
}

fn status_label(status: JobStatus) -> String {
    match status {
        JobStatus::Completed => status.to_string().green().bold().to_string(),
        JobStatus::Failed => status.to_string().red().bold().to_string(),
        JobStatus::Cancelled => status.to_string().yellow().bold().to_string(),
        _ => status.to_string(),
    }
}

fn print_results(job: &Job) {
    println!();
    println!("Job {} {}", job.id, status_label(job.status));
    for result in &job.results {
        let mark = if result.success { "ok".green() } else { "failed".red() };
        println!(
            "  {:<16} {:<14} {:>6} -> {:<6} rows  {:>3} row errors  {:>6} ms  {}",
            result.block_id,
            result.kind.as_str(),
            result.rows_in,
            result.rows_out,
            result.row_errors,
            result.duration_ms,
            mark
        );
        if let Some(err) = &result.error {
            println!("    {}", err.red());
        }
    }
    if let Some(path) = &job.final_output_path {
        println!();
        println!("Output: {}", path.bold());
    }
    if let Some(message) = &job.error_message {
        println!();
        println!("Error: {}", message.red());
    }
}

/// Main application entry point.
async fn run(config: Config) -> Result<bool, Box<dyn std::error::Error>> {
    let mut settings = Settings::from_env();
    apply_overrides(&mut settings, &config);
    let client = settings.enrichment.build_client()?;

    if config.check_service {
        info!("Checking {} at {}", client.service_name(), settings.enrichment.base_url);
        match client.check_service().await {
            Ok(()) => println!("Enrichment service: {}", "reachable".green()),
            Err(e) => {
                println!("Enrichment service: {} ({})", "unreachable".red(), e);
                return Ok(false);
            }
        }
    }

    let Some(workflow_path) = config.workflow_path else {
        return Ok(true);
    };

    info!("Loading workflow: {}", workflow_path);
    let (definition, workflow, plan) = load_and_plan(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;
    info!(
        "Workflow '{}' loaded: {} blocks, {} connections",
        workflow.name,
        workflow.len(),
        workflow.connections.len()
    );

    if config.dry_run {
        println!("Execution plan:");
        for line in plan.describe() {
            println!("{}", line);
        }
        return Ok(true);
    }

    if settings.enrichment.api_key.is_none() && plan.steps().iter().any(|s| s.block.kind().uses_enrichment()) {
        warn!("ENRICHMENT_API_KEY is not set; enrichment blocks will flag every row");
    }

    info!("Data directory: {}", settings.data_dir.display());
    let store = Arc::new(FileStore::new(&settings.state_dir));
    let controller = JobController::new(&settings, Some(client), store);

    let job_id = controller.submit_job(definition).await?;
    let job = tokio::select! {
        job = controller.wait_for(&job_id) => job?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling job {}", job_id);
            controller.cancel_job(&job_id);
            controller.wait_for(&job_id).await?
        }
    };

    print_results(&job);
    Ok(job.status == JobStatus::Completed)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let config = match parse_arguments(&args) {
        Ok(Command::Run(config)) => config,
        Ok(Command::Help) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!("{} {}", APP_NAME, VERSION);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    setup_logging(config.verbose);
    print_banner();

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
