//! Top-level coordination of a sharded test run.
//!
//! The orchestrator discovers the expected test set, applies include/exclude
//! filtering, partitions the result into shards, and drives each shard's
//! controller on its own task. Shards are independent: each gets its own
//! runner (channel) and its own sink, and a transport failure on one shard
//! does not stop the others.
//!
//! # Execution Flow
//!
//! 1. **Discovery**: Enumerate the expected test set via a collection pass
//! 2. **Filtering**: Apply include/exclude rules before partitioning
//! 3. **Partitioning**: Split into exactly N disjoint shards
//! 4. **Execution**: Run each non-empty shard's controller concurrently
//! 5. **Aggregation**: Combine shard outcomes into a [`RunSummary`]

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::config::HarnessConfig;
use crate::controller::ShardController;
use crate::events::{ExpectedTestSet, Metrics, TestEventSink, TestIdentity};
use crate::runner::{RemoteRunner, RerunFilter, RunnerResult};
use crate::shard::{Shard, TestCollection, TestFilter, TestGroup};

/// Aggregated results of an entire sharded run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every expected test completed and passed |
/// | 1 | Failures, missing tests, or transport errors |
/// | 2 | Everything passed, but only after reruns |
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Non-empty shards that were executed.
    pub shards: usize,

    /// Total expected tests across all shards, after filtering.
    pub expected: usize,

    /// Tests that completed in the reconciled streams.
    pub completed: usize,

    /// Tests that completed with a failure outcome.
    pub failed: usize,

    /// Run-level failures reported across all shards.
    pub run_failures: usize,

    /// Shards aborted by a transport-fatal error.
    pub transport_errors: usize,

    /// Attempts consumed across all shards.
    pub attempts_used: usize,

    /// Wall-clock duration of the whole run.
    pub duration: Duration,
}

impl RunSummary {
    /// Whether every expected test completed without failures.
    pub fn success(&self) -> bool {
        self.transport_errors == 0
            && self.failed == 0
            && self.run_failures == 0
            && self.completed >= self.expected
    }

    /// Conventional process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.attempts_used > self.shards {
            // Completed, but some shard needed a rerun.
            2
        } else {
            0
        }
    }
}

/// Restricts a runner to one shard's slice of the collection.
///
/// The expected set is the shard's member list; an unfiltered `run` becomes
/// a run filtered to the shard's members, so rerun filters (always subsets
/// of the shard) pass through unchanged.
struct ShardRunner<R> {
    inner: R,
    members: Vec<TestIdentity>,
    base_filter: RerunFilter,
}

impl<R> ShardRunner<R> {
    fn new(inner: R, members: Vec<TestIdentity>) -> Self {
        let base_filter = RerunFilter::new(members.iter().cloned());
        Self {
            inner,
            members,
            base_filter,
        }
    }
}

#[async_trait::async_trait]
impl<R: RemoteRunner> RemoteRunner for ShardRunner<R> {
    async fn collect(&mut self) -> RunnerResult<ExpectedTestSet> {
        Ok(ExpectedTestSet::new(self.members.iter().cloned()))
    }

    async fn run(
        &mut self,
        filter: Option<&RerunFilter>,
        sink: &mut dyn TestEventSink,
    ) -> RunnerResult<()> {
        let filter = filter.unwrap_or(&self.base_filter);
        self.inner.run(Some(filter), sink).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Counts failure events on the way through to the real sink.
struct StatsSink<S> {
    inner: S,
    failed: usize,
    run_failures: usize,
}

impl<S> StatsSink<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            failed: 0,
            run_failures: 0,
        }
    }
}

impl<S: TestEventSink> TestEventSink for StatsSink<S> {
    fn run_started(&mut self, run_name: &str, expected_count: usize) {
        self.inner.run_started(run_name, expected_count);
    }

    fn test_started(&mut self, test: &TestIdentity, timestamp: Option<DateTime<Utc>>) {
        self.inner.test_started(test, timestamp);
    }

    fn test_failed(&mut self, test: &TestIdentity, trace: &str) {
        self.failed += 1;
        self.inner.test_failed(test, trace);
    }

    fn test_assumption_failure(&mut self, test: &TestIdentity, trace: &str) {
        self.inner.test_assumption_failure(test, trace);
    }

    fn test_ignored(&mut self, test: &TestIdentity) {
        self.inner.test_ignored(test);
    }

    fn test_ended(&mut self, test: &TestIdentity, timestamp: Option<DateTime<Utc>>, metrics: &Metrics) {
        self.inner.test_ended(test, timestamp, metrics);
    }

    fn run_failed(&mut self, message: &str) {
        self.run_failures += 1;
        self.inner.run_failed(message);
    }

    fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.inner.run_ended(elapsed, metrics);
    }
}

/// Group a flat expected set into per-scope test groups, preserving order.
pub fn group_by_scope(expected: &ExpectedTestSet) -> Vec<TestGroup> {
    let mut groups: Vec<TestGroup> = Vec::new();
    for test in expected.iter() {
        match groups.iter_mut().find(|g| g.identity == test.scope) {
            Some(group) => group.members.push(test.clone()),
            None => groups.push(TestGroup::new(
                test.scope.clone(),
                vec![test.clone()],
                Duration::ZERO,
            )),
        }
    }
    groups
}

/// Coordinates discovery, sharding, and parallel shard execution.
///
/// `make_runner` is called once per shard (index-keyed) so every shard gets
/// its own channel; `make_sink` likewise, so shard event streams never
/// interleave within a sink.
pub struct Orchestrator<F> {
    harness: HarnessConfig,
    filter: TestFilter,
    make_runner: F,
}

impl<F, R> Orchestrator<F>
where
    F: Fn(usize) -> R,
    R: RemoteRunner + 'static,
{
    /// Create an orchestrator from harness settings and a runner factory.
    pub fn new(harness: HarnessConfig, filter: TestFilter, make_runner: F) -> Self {
        Self {
            harness,
            filter,
            make_runner,
        }
    }

    /// Enumerate the expected test set through a collection pass, grouped
    /// by scope. Filtering is not applied here.
    pub async fn discover(&self) -> RunnerResult<Vec<TestGroup>> {
        let mut probe = (self.make_runner)(0);
        let expected = probe.collect().await?;
        debug!(tests = expected.len(), "collection pass finished");
        Ok(group_by_scope(&expected))
    }

    /// Discover, filter, shard, and run everything to completion.
    pub async fn run<MS, S>(&self, make_sink: MS) -> anyhow::Result<RunSummary>
    where
        MS: Fn(usize) -> S,
        S: TestEventSink + 'static,
    {
        let start = Instant::now();

        let groups = self.discover().await?;
        let mut collection = TestCollection::new(
            groups,
            Duration::from_millis(self.harness.runtime_hint_ms),
            &self.filter,
        );
        let shards = collection.shard(self.harness.shard_count, self.harness.granularity)?;

        let mut summary = RunSummary {
            expected: shards.iter().map(Shard::member_count).sum(),
            ..RunSummary::default()
        };

        info!(
            tests = summary.expected,
            shards = shards.len(),
            granularity = ?self.harness.granularity,
            "scheduled run"
        );

        let mut tasks = tokio::task::JoinSet::new();
        for shard in shards {
            // An empty shard is a no-op: no run_started, no attempt budget.
            if shard.is_empty() {
                debug!(shard = shard.index, "shard is empty, skipping");
                continue;
            }
            summary.shards += 1;

            let members: Vec<TestIdentity> = shard.members().cloned().collect();
            let runner = ShardRunner::new((self.make_runner)(shard.index), members);
            let mut sink = StatsSink::new(make_sink(shard.index));
            let run_name = if shard.total_shards == 1 {
                self.harness.run_name.clone()
            } else {
                format!(
                    "{} shard {}/{}",
                    self.harness.run_name, shard.index, shard.total_shards
                )
            };
            let budget = self.harness.attempt_budget;
            let index = shard.index;
            let hint = shard.runtime_hint;

            tasks.spawn(async move {
                debug!(shard = index, hint_ms = hint.as_millis() as u64, "shard starting");
                let mut controller = ShardController::new(runner, run_name, budget);
                let outcome = controller.execute(&mut sink).await;
                (index, outcome, sink.failed, sink.run_failures)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome, failed, run_failures) = joined?;
            summary.failed += failed;
            summary.run_failures += run_failures;
            match outcome {
                Ok(outcome) => {
                    summary.completed += outcome.completed;
                    summary.attempts_used += outcome.attempts_used;
                }
                Err(e) => {
                    error!(shard = index, error = %e, "shard aborted on transport failure");
                    summary.transport_errors += 1;
                }
            }
        }

        summary.duration = start.elapsed();
        Ok(summary)
    }
}
