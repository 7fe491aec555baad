//! retread: a resilient remote-target test harness.
//!
//! This crate runs test suites on targets reached through a narrow command
//! channel (a device, an emulator, or a local process) and guarantees that
//! the caller observes one complete, well-formed result stream even when the
//! suite crashes, hangs, or produces truncated output partway through.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Events**: The canonical test lifecycle protocol ([`TestEventSink`])
//! - **Shard**: Deterministic partitioning of a collection across channels
//! - **Parser**: Streaming conversion of raw process output into events
//! - **Runner**: The channel to one remote target ([`RemoteRunner`])
//! - **Controller**: Batch-then-serial rerun escalation within a budget
//! - **Orchestrator**: Parallel shard execution and result aggregation
//!
//! # Example
//!
//! ```no_run
//! use retread::config::load_config;
//! use retread::orchestrator::Orchestrator;
//! use retread::report::ConsoleSink;
//! use retread::runner::process::ProcessRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("retread.toml"))?;
//!
//!     let runner_config = config.runner.clone();
//!     let orchestrator = Orchestrator::new(config.harness, config.filter, move |shard| {
//!         ProcessRunner::new(format!("shard-{}", shard), runner_config.clone())
//!     });
//!
//!     let summary = orchestrator.run(|_| ConsoleSink::new(false)).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod config;
pub mod controller;
pub mod events;
pub mod orchestrator;
pub mod parser;
pub mod report;
pub mod runner;
pub mod shard;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use controller::{ShardController, ShardOutcome};
pub use events::{ExpectedTestSet, Metrics, TestEventSink, TestIdentity};
pub use orchestrator::{Orchestrator, RunSummary};
pub use parser::{OutputFormat, ResultParser};
pub use runner::{RemoteRunner, RerunFilter};
pub use shard::{Granularity, Shard, TestCollection};
