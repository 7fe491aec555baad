//! Configuration loading and schema definitions.
//!
//! The harness is configured from a TOML file with three sections:
//!
//! ```text
//! Config (root)
//! ├── HarnessConfig       - run name, attempt budget, shard count, granularity
//! ├── ProcessRunnerConfig - test command, collect command, output format
//! └── TestFilter          - include/exclude filtering (optional)
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::parser::OutputFormat;
use crate::shard::{Granularity, TestFilter};

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use retread::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [harness]
///     run_name = "native-suite"
///     attempt_budget = 3
///     shard_count = 2
///
///     [runner]
///     command = "./run_tests.sh"
///     collect_args = ["--list"]
/// "#).unwrap();
///
/// assert_eq!(config.harness.shard_count, 2);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core harness settings (attempt budget, sharding).
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Runner configuration: the command that executes tests.
    pub runner: ProcessRunnerConfig,

    /// Include/exclude filtering, applied before sharding.
    #[serde(default)]
    pub filter: TestFilter,
}

/// Core harness execution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Name reported in `run_started` events.
    #[serde(default = "default_run_name")]
    pub run_name: String,

    /// Maximum number of execution attempts per shard, counting the initial
    /// batch run. Reruns stop when the budget is exhausted even if tests
    /// remain incomplete.
    ///
    /// Default: 3
    #[serde(default = "default_attempt_budget")]
    pub attempt_budget: usize,

    /// Number of shards to split the collection into.
    ///
    /// Default: 1
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Sharding granularity: whole classes or individual methods.
    #[serde(default)]
    pub granularity: Granularity,

    /// Declared estimate of the whole collection's runtime, distributed
    /// proportionally across shards. Zero disables load hints.
    #[serde(default)]
    pub runtime_hint_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            run_name: default_run_name(),
            attempt_budget: default_attempt_budget(),
            shard_count: default_shard_count(),
            granularity: Granularity::default(),
            runtime_hint_ms: 0,
        }
    }
}

/// Configuration for the process-backed runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessRunnerConfig {
    /// Program to execute.
    pub command: String,

    /// Arguments for a test run.
    #[serde(default)]
    pub args: Vec<String>,

    /// Arguments for the collection (dry-run) pass; the command is expected
    /// to print one `scope#name` identity per line.
    #[serde(default)]
    pub collect_args: Vec<String>,

    /// Flag used to pass the rerun filter file path to the command.
    ///
    /// Default: `--test-filter-file`
    #[serde(default = "default_filter_flag")]
    pub filter_flag: String,

    /// Working directory for the command.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Per-attempt timeout. A hung command is killed and the attempt is
    /// reported as a run failure, driving the rerun machinery.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Output format the command produces.
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_run_name() -> String {
    "retread".to_string()
}

fn default_attempt_budget() -> usize {
    3
}

fn default_shard_count() -> usize {
    1
}

fn default_filter_flag() -> String {
    "--test-filter-file".to_string()
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
