//! quartermaster CLI - test environment provisioner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use quartermaster::api::{Backend, ConfigureRequest, EnvironmentRequest};
use quartermaster::config::{self, Config};
use quartermaster::orchestrator::EnvironmentOrchestrator;
use quartermaster::provider::{PoolProviderFactory, ResourceKind};
use quartermaster::registry::ProviderRegistry;
use quartermaster::store::MemoryStore;
use quartermaster::suite::JsonFileSuiteSource;
use quartermaster::tasks::{TaskPool, TaskStatus};

#[derive(Parser)]
#[command(name = "quartermaster")]
#[command(about = "Test environment provisioner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "quartermaster.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out an environment for a suite and print it
    Run {
        /// Suite id to request an environment for
        #[arg(short, long)]
        suite_id: String,

        /// Release the environment again after printing it
        #[arg(long)]
        release: bool,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { suite_id, release } => run(&cli.config, &suite_id, release).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

async fn run(config_path: &Path, suite_id: &str, release: bool) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let definition = config
        .suite
        .definition
        .as_ref()
        .context("No suite definition file configured under [suite]")?;

    let backend = build_backend(&config, definition);
    register_providers(&backend, &config)?;

    // Select the first registered provider of each class for this run.
    let provider_id = |rulesets: &[quartermaster::Ruleset], class: &str| -> Result<String> {
        rulesets
            .first()
            .map(|r| r.id.clone())
            .with_context(|| format!("No {class} provider configured under [[providers.{class}]]"))
    };
    backend
        .configure(ConfigureRequest {
            suite_id: Some(suite_id.to_string()),
            iut_provider: Some(provider_id(&config.providers.iut, "iut")?),
            execution_space_provider: Some(provider_id(
                &config.providers.execution_space,
                "execution_space",
            )?),
            log_area_provider: Some(provider_id(&config.providers.log_area, "log_area")?),
            dataset: Some(config.dataset.clone()),
        })?;

    let requested = backend.request_environment(EnvironmentRequest {
        suite_id: Some(suite_id.to_string()),
        suite_runner_ids: Vec::new(),
    })?;
    let task_id = requested.data.id;
    info!("Environment checkout started as task {}", task_id);

    let report = poll(&backend, &task_id, config.quartermaster.checkout_timeout_secs).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = report.status == TaskStatus::Failure;

    if release {
        let response = backend.release_environment(Some(suite_id)).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        if !response.success {
            std::process::exit(1);
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn build_backend(config: &Config, definition: &Path) -> Backend {
    let registry = ProviderRegistry::new(Arc::new(MemoryStore::new()));
    let orchestrator = EnvironmentOrchestrator::new(
        registry,
        Arc::new(JsonFileSuiteSource::new(definition)),
        Arc::new(PoolProviderFactory::new()),
    );
    Backend::new(orchestrator, TaskPool::new(config.quartermaster.workers))
}

fn register_providers(backend: &Backend, config: &Config) -> Result<()> {
    let registry = backend.registry();
    for ruleset in &config.providers.iut {
        registry.register_provider(ResourceKind::Iut, ruleset)?;
    }
    for ruleset in &config.providers.execution_space {
        registry.register_provider(ResourceKind::ExecutionSpace, ruleset)?;
    }
    for ruleset in &config.providers.log_area {
        registry.register_provider(ResourceKind::LogArea, ruleset)?;
    }
    Ok(())
}

async fn poll(
    backend: &Backend,
    task_id: &str,
    timeout_secs: u64,
) -> Result<quartermaster::tasks::StatusReport> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let report = backend.check_environment_status(Some(task_id))?;
        match report.status {
            TaskStatus::Pending | TaskStatus::Started => {
                if tokio::time::Instant::now() >= deadline {
                    bail!("Environment checkout did not finish within {timeout_secs}s");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            TaskStatus::Success | TaskStatus::Failure => return Ok(report),
        }
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Workers: {}", config.quartermaster.workers);
            println!(
                "  Checkout timeout: {}s",
                config.quartermaster.checkout_timeout_secs
            );
            println!("  IUT providers: {}", config.providers.iut.len());
            println!(
                "  Execution space providers: {}",
                config.providers.execution_space.len()
            );
            println!("  Log area providers: {}", config.providers.log_area.len());
            match &config.suite.definition {
                Some(path) => println!("  Suite definition: {}", path.display()),
                None => println!("  Suite definition: (none)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let config = r#"# quartermaster configuration file

[quartermaster]
workers = 2
checkout_timeout_secs = 10

[[providers.iut]]
id = "default"
instances = [
    { identity = "pkg:generic/product@1.0.0" },
    { identity = "pkg:generic/product@1.0.0" },
    { identity = "pkg:generic/product@1.0.0" },
]

[[providers.execution_space]]
id = "default"
instances = [
    { request = { url = "http://executor/", method = "POST" } },
    { request = { url = "http://executor/", method = "POST" } },
    { request = { url = "http://executor/", method = "POST" } },
]

[[providers.log_area]]
id = "default"
shared = true
instances = [
    { upload = { url = "http://logs/{folder}/{name}", method = "PUT" } },
]

[suite]
definition = "suite.json"

[dataset]
iut_amount = 3
execution_space_amount = 3
log_area_amount = 1
"#;

    let suite = r#"{
  "name": "regression",
  "priority": 1,
  "recipes": [
    {
      "id": "e975ff09-342e-4da8-b109-f2fbbbbda153",
      "constraints": [
        { "key": "TEST_RUNNER", "value": "pytest_testrunner:latest" },
        { "key": "COMMAND", "value": "python -m pytest" }
      ],
      "testCase": { "id": "test_checkout" }
    },
    {
      "id": "8d3f57a1-55a2-4a7f-9a4c-bf8c41e85cc1",
      "constraints": [
        { "key": "TEST_RUNNER", "value": "pytest_testrunner:latest" },
        { "key": "COMMAND", "value": "python -m pytest" }
      ],
      "testCase": { "id": "test_release" }
    },
    {
      "id": "4e9b2e57-3c44-44a5-8a74-6a7b3f12f0ce",
      "constraints": [
        { "key": "TEST_RUNNER", "value": "pytest_testrunner:latest" },
        { "key": "COMMAND", "value": "python -m pytest" }
      ],
      "testCase": { "id": "test_split" }
    }
  ]
}
"#;

    let config_path = PathBuf::from("quartermaster.toml");
    if config_path.exists() {
        eprintln!("quartermaster.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }
    std::fs::write(&config_path, config)?;

    let suite_path = PathBuf::from("suite.json");
    if !suite_path.exists() {
        std::fs::write(&suite_path, suite)?;
    }

    println!("Created quartermaster.toml and suite.json");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  quartermaster run --suite-id my-suite");

    Ok(())
}
