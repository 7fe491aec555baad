//! retread CLI - resilient remote-target test harness.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use retread::config::{self, Config};
use retread::orchestrator::Orchestrator;
use retread::report::ConsoleSink;
use retread::runner::RemoteRunner;
use retread::runner::process::ProcessRunner;

#[derive(Parser)]
#[command(name = "retread")]
#[command(about = "Resilient remote-target test harness", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "retread.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Override the number of shards
        #[arg(short, long)]
        shards: Option<usize>,

        /// Override the attempt budget per shard
        #[arg(short, long)]
        attempts: Option<usize>,

        /// Only collect tests, don't run them
        #[arg(long)]
        collect_only: bool,
    },

    /// Collect the expected test set without running it
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
        Commands::Run {
            shards,
            attempts,
            collect_only,
        } => run_tests(&cli.config, shards, attempts, collect_only, cli.verbose).await,
        Commands::Collect { format } => collect_tests(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

async fn run_tests(
    config_path: &Path,
    shards_override: Option<usize>,
    attempts_override: Option<usize>,
    collect_only: bool,
    verbose: bool,
) -> Result<()> {
    let mut config = load(config_path)?;

    // Apply overrides
    if let Some(shards) = shards_override {
        config.harness.shard_count = shards;
    }
    if let Some(attempts) = attempts_override {
        config.harness.attempt_budget = attempts;
    }

    info!("Loaded configuration from {}", config_path.display());

    if collect_only {
        return print_expected_set(&config, "text").await;
    }

    let runner_config = config.runner.clone();
    let orchestrator = Orchestrator::new(config.harness, config.filter, move |shard| {
        ProcessRunner::new(format!("shard-{}", shard), runner_config.clone())
    });

    let summary = orchestrator.run(|_| ConsoleSink::new(verbose)).await?;

    info!(
        shards = summary.shards,
        completed = summary.completed,
        expected = summary.expected,
        attempts = summary.attempts_used,
        "run finished in {:?}",
        summary.duration
    );
    std::process::exit(summary.exit_code());
}

async fn collect_tests(config_path: &Path, format: &str) -> Result<()> {
    let config = load(config_path)?;
    print_expected_set(&config, format).await
}

async fn print_expected_set(config: &Config, format: &str) -> Result<()> {
    let mut runner = ProcessRunner::new(&config.harness.run_name, config.runner.clone());
    let expected = runner.collect().await?;

    match format {
        "json" => {
            let tests: Vec<_> = expected.iter().collect();
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        _ => {
            println!("Collected {} tests:", expected.len());
            for test in expected.iter() {
                println!("  {}", test);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Run name: {}", config.harness.run_name);
            println!("  Shards: {}", config.harness.shard_count);
            println!("  Attempt budget: {}", config.harness.attempt_budget);
            println!("  Granularity: {:?}", config.harness.granularity);
            println!("  Command: {}", config.runner.command);
            println!("  Output format: {:?}", config.runner.format);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let config = r#"# retread configuration file

[harness]
run_name = "retread"
attempt_budget = 3
shard_count = 1
# "class" assigns whole groups to shards; "method" spreads individual tests
granularity = "class"

[runner]
command = "./run_tests.sh"
args = []
# The collect invocation must print one `scope#name` identity per line
collect_args = ["--list"]
# Rerun filter file is passed as: <command> <args> <filter_flag> <path>
filter_flag = "--test-filter-file"
# Output format: gtest, pyunit, benchmark
format = "gtest"
timeout_secs = 900

[filter]
# include_groups = []
# exclude_groups = []
# include_tests = []
# exclude_tests = []
"#;

    let path = PathBuf::from("retread.toml");
    if path.exists() {
        eprintln!("retread.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created retread.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  retread run");

    Ok(())
}
