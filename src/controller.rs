//! Resilient execution of one shard against a remote runner.
//!
//! The controller collects the expected test set, runs it, detects tests
//! that were lost to crashes, hangs, or truncated output, and re-runs only
//! what is missing: first as a filtered batch, then one test at a time if
//! the batch rerun stalls. The caller's sink observes one reconciled event
//! stream, equivalent to a single successful run of the full expected set.
//!
//! The controller is synchronous with respect to its runner: the remote
//! channel is an exclusive resource, so one invocation is awaited to
//! completion before the next is issued. Parallelism exists only across
//! shards, each with its own controller and runner.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::events::{Metrics, TestEventSink, TestIdentity};
use crate::runner::{RemoteRunner, RerunFilter, RunnerResult};

/// Accounting for one runner invocation. Created and consumed inside the
/// controller; never escapes it.
#[derive(Debug, Default)]
struct RunAttempt {
    /// Tests this attempt was asked to run, in order.
    requested: Vec<TestIdentity>,
    /// Tests the runner reported as started.
    started: HashSet<TestIdentity>,
    /// Tests the runner reported as ended.
    completed: HashSet<TestIdentity>,
    /// Whether the runner reported a run-level failure.
    run_failed: bool,
    /// First run-level failure message, if any.
    diagnostic: Option<String>,
}

impl RunAttempt {
    /// Requested tests that did not complete: the started-but-unfinished
    /// plus the never-started, in requested order.
    ///
    /// A parameterized request (`m[0]`) that was never reported under its
    /// indexed name counts as complete if its base name was, since reruns
    /// are filtered by base name and the runner may report either form.
    fn remaining(&self) -> Vec<TestIdentity> {
        self.requested
            .iter()
            .filter(|t| {
                if self.completed.contains(*t) {
                    return false;
                }
                if t.is_parameterized() && !self.started.contains(*t) {
                    let key = t.rerun_key();
                    if self.completed.iter().any(|c| c.rerun_key() == key) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }
}

/// Interposed on every runner invocation: tracks per-attempt accounting and
/// forwards events to the real sink, reconciling across attempts.
///
/// Forwarding rules keep the reconciled stream well-formed: a `test_started`
/// for an identity that is already open or already completed is suppressed,
/// as is any terminal event for an identity that is not open. Run-level
/// events are swallowed; the controller announces the reconciled run itself.
struct AttemptSink<'a> {
    inner: &'a mut dyn TestEventSink,
    /// Rerun keys eligible for forwarding; `None` forwards everything.
    allowed: Option<HashSet<TestIdentity>>,
    /// Identities started but not yet ended in the reconciled stream.
    open: &'a mut HashSet<TestIdentity>,
    /// Identities already ended in the reconciled stream.
    done: &'a mut HashSet<TestIdentity>,
    attempt: RunAttempt,
}

impl<'a> AttemptSink<'a> {
    fn new(
        inner: &'a mut dyn TestEventSink,
        allowed: Option<HashSet<TestIdentity>>,
        open: &'a mut HashSet<TestIdentity>,
        done: &'a mut HashSet<TestIdentity>,
        requested: Vec<TestIdentity>,
    ) -> Self {
        Self {
            inner,
            allowed,
            open,
            done,
            attempt: RunAttempt {
                requested,
                ..RunAttempt::default()
            },
        }
    }

    fn admits(&self, test: &TestIdentity) -> bool {
        match &self.allowed {
            None => true,
            Some(keys) => keys.contains(&test.rerun_key()),
        }
    }
}

impl TestEventSink for AttemptSink<'_> {
    fn run_started(&mut self, _run_name: &str, _expected_count: usize) {}

    fn test_started(&mut self, test: &TestIdentity, timestamp: Option<DateTime<Utc>>) {
        self.attempt.started.insert(test.clone());
        if self.admits(test) && !self.done.contains(test) && !self.open.contains(test) {
            self.open.insert(test.clone());
            self.inner.test_started(test, timestamp);
        }
    }

    fn test_failed(&mut self, test: &TestIdentity, trace: &str) {
        if self.admits(test) && self.open.contains(test) {
            self.inner.test_failed(test, trace);
        }
    }

    fn test_assumption_failure(&mut self, test: &TestIdentity, trace: &str) {
        if self.admits(test) && self.open.contains(test) {
            self.inner.test_assumption_failure(test, trace);
        }
    }

    fn test_ignored(&mut self, test: &TestIdentity) {
        if self.admits(test) && self.open.contains(test) {
            self.inner.test_ignored(test);
        }
    }

    fn test_ended(&mut self, test: &TestIdentity, timestamp: Option<DateTime<Utc>>, metrics: &Metrics) {
        self.attempt.completed.insert(test.clone());
        if self.admits(test) && self.open.remove(test) {
            self.done.insert(test.clone());
            self.inner.test_ended(test, timestamp, metrics);
        }
    }

    fn run_failed(&mut self, message: &str) {
        self.attempt.run_failed = true;
        if self.attempt.diagnostic.is_none() {
            self.attempt.diagnostic = Some(message.to_string());
        }
    }

    fn run_ended(&mut self, _elapsed: std::time::Duration, _metrics: &Metrics) {}
}

/// Summary of one shard's reconciled execution.
#[derive(Debug, Clone, Default)]
pub struct ShardOutcome {
    /// Declared size of the expected test set.
    pub expected: usize,
    /// Tests that ended in the reconciled stream. Fewer than `expected`
    /// means the attempt budget ran out with tests incomplete.
    pub completed: usize,
    /// Attempts consumed, counting the initial batch run and each rerun
    /// loop iteration (a full serial sweep counts as one).
    pub attempts_used: usize,
}

impl ShardOutcome {
    /// Whether every expected test completed.
    pub fn is_complete(&self) -> bool {
        self.completed >= self.expected
    }
}

/// Drives one shard to completion against its runner.
pub struct ShardController<R> {
    runner: R,
    run_name: String,
    attempt_budget: usize,
}

impl<R: RemoteRunner> ShardController<R> {
    /// Create a controller with the given attempt budget (minimum 1).
    pub fn new(runner: R, run_name: impl Into<String>, attempt_budget: usize) -> Self {
        Self {
            runner,
            run_name: run_name.into(),
            attempt_budget: attempt_budget.max(1),
        }
    }

    /// Collect the expected set and run it to completion, retrying what
    /// fails to complete, within the attempt budget.
    ///
    /// Recoverable failures are absorbed and drive the rerun machinery;
    /// only transport-fatal errors surface as `Err`, after any partial
    /// events already forwarded.
    pub async fn execute(&mut self, sink: &mut dyn TestEventSink) -> RunnerResult<ShardOutcome> {
        let start = Instant::now();

        let expected = self.runner.collect().await?;
        if expected.is_empty() {
            info!(run = %self.run_name, "no tests collected, reporting empty run");
            sink.run_started(&self.run_name, 0);
            sink.run_ended(start.elapsed(), &Metrics::new());
            return Ok(ShardOutcome::default());
        }

        info!(run = %self.run_name, expected = expected.len(), "starting run");
        sink.run_started(&self.run_name, expected.len());

        let mut open: HashSet<TestIdentity> = HashSet::new();
        let mut done: HashSet<TestIdentity> = HashSet::new();
        let mut remaining: Vec<TestIdentity> = expected.iter().cloned().collect();
        let mut attempts_used = 0;
        let mut serial = false;
        let mut any_started = false;
        let mut first_diagnostic: Option<String> = None;

        while !remaining.is_empty() && attempts_used < self.attempt_budget {
            attempts_used += 1;

            if !serial {
                let initial = attempts_used == 1;
                let filter = if initial {
                    None
                } else {
                    Some(RerunFilter::new(remaining.iter().cloned()))
                };
                let allowed = filter
                    .as_ref()
                    .map(|f| f.entries().iter().cloned().collect::<HashSet<_>>());

                let mut attempt_sink =
                    AttemptSink::new(sink, allowed, &mut open, &mut done, remaining.clone());
                self.runner.run(filter.as_ref(), &mut attempt_sink).await?;
                let attempt = attempt_sink.attempt;

                any_started |= !attempt.started.is_empty();
                let next = attempt.remaining();
                if first_diagnostic.is_none() {
                    first_diagnostic = attempt.diagnostic;
                }
                debug!(
                    run = %self.run_name,
                    attempt = attempts_used,
                    remaining = next.len(),
                    run_failed = attempt.run_failed,
                    "attempt finished"
                );

                // A rerun that leaves the remaining set unchanged made no
                // progress; running the stragglers together again would
                // just stall the same way.
                if !initial && next.len() == remaining.len() {
                    warn!(
                        run = %self.run_name,
                        stuck = next.len(),
                        "batch rerun made no progress, escalating to serial"
                    );
                    serial = true;
                }
                remaining = next;
            } else {
                // One serial sweep over the remaining tests is one attempt.
                // A test that still fails to complete here is dropped from
                // further automatic retry.
                let mut dropped = 0;
                for test in remaining.clone() {
                    let allowed: HashSet<_> = [test.rerun_key()].into_iter().collect();
                    let mut attempt_sink = AttemptSink::new(
                        sink,
                        Some(allowed),
                        &mut open,
                        &mut done,
                        vec![test.clone()],
                    );
                    self.runner.run_single(&test, &mut attempt_sink).await?;
                    let attempt = attempt_sink.attempt;

                    any_started |= !attempt.started.is_empty();
                    let incomplete = !attempt.remaining().is_empty();
                    if first_diagnostic.is_none() {
                        first_diagnostic = attempt.diagnostic;
                    }
                    if incomplete {
                        warn!(run = %self.run_name, test = %test, "test did not complete in isolation, dropping");
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    debug!(run = %self.run_name, dropped, "serial sweep dropped incomplete tests");
                }
                remaining.clear();
            }
        }

        if !remaining.is_empty() {
            warn!(
                run = %self.run_name,
                incomplete = remaining.len(),
                budget = self.attempt_budget,
                "attempt budget exhausted with tests incomplete"
            );
        }

        // If nothing ever started, the caller deserves the original
        // diagnostic rather than a silent empty run.
        if !any_started {
            let message = first_diagnostic
                .unwrap_or_else(|| "No tests were executed in any attempt".to_string());
            sink.run_failed(&message);
        }

        sink.run_ended(start.elapsed(), &Metrics::new());

        Ok(ShardOutcome {
            expected: expected.len(),
            completed: done.len(),
            attempts_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingSink, ExpectedTestSet, TestEvent};
    use crate::runner::RunnerError;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    fn t(name: &str) -> TestIdentity {
        TestIdentity::new("A", name)
    }

    #[derive(Clone)]
    enum Action {
        Complete(TestIdentity),
        StartOnly(TestIdentity),
        RunFailed(&'static str),
    }

    /// A runner that replays a fixed script per batch invocation and records
    /// everything it was asked to do.
    struct ScriptedRunner {
        expected: Vec<TestIdentity>,
        batch_scripts: VecDeque<Vec<Action>>,
        single_succeeds: bool,
        single_run_failed: Option<&'static str>,
        transport_dead: bool,
        run_filters: Vec<Option<Vec<String>>>,
        single_calls: Vec<TestIdentity>,
    }

    impl ScriptedRunner {
        fn new(expected: Vec<TestIdentity>, batch_scripts: Vec<Vec<Action>>) -> Self {
            Self {
                expected,
                batch_scripts: batch_scripts.into(),
                single_succeeds: true,
                single_run_failed: None,
                transport_dead: false,
                run_filters: Vec::new(),
                single_calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl RemoteRunner for ScriptedRunner {
        async fn collect(&mut self) -> RunnerResult<ExpectedTestSet> {
            Ok(ExpectedTestSet::new(self.expected.clone()))
        }

        async fn run(
            &mut self,
            filter: Option<&RerunFilter>,
            sink: &mut dyn TestEventSink,
        ) -> RunnerResult<()> {
            self.run_filters.push(
                filter.map(|f| f.entries().iter().map(|e| e.to_string()).collect()),
            );
            if self.transport_dead {
                return Err(RunnerError::Transport("device lost".to_string()));
            }
            let script = self.batch_scripts.pop_front().unwrap_or_default();
            sink.run_started("scripted", 0);
            for action in script {
                match action {
                    Action::Complete(test) => {
                        sink.test_started(&test, None);
                        sink.test_ended(&test, None, &Metrics::new());
                    }
                    Action::StartOnly(test) => sink.test_started(&test, None),
                    Action::RunFailed(message) => sink.run_failed(message),
                }
            }
            Ok(())
        }

        async fn run_single(
            &mut self,
            test: &TestIdentity,
            sink: &mut dyn TestEventSink,
        ) -> RunnerResult<()> {
            self.single_calls.push(test.clone());
            if let Some(message) = self.single_run_failed {
                sink.run_failed(message);
                return Ok(());
            }
            sink.test_started(test, None);
            if self.single_succeeds {
                sink.test_ended(test, None, &Metrics::new());
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// No identity may start twice without an intervening end.
    fn assert_no_duplicate_starts(sink: &CollectingSink) {
        let mut open = HashSet::new();
        for event in &sink.events {
            match event {
                TestEvent::TestStarted(test) => {
                    assert!(open.insert(test.clone()), "{} started while open", test);
                }
                TestEvent::TestEnded(test) => {
                    open.remove(test);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_single_clean_attempt() {
        let tests = vec![t("t1"), t("t2"), t("t3")];
        let runner = ScriptedRunner::new(
            tests.clone(),
            vec![tests.iter().cloned().map(Action::Complete).collect()],
        );
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.expected, 3);
        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.attempts_used, 1);
        assert!(outcome.is_complete());
        assert_eq!(sink.expected_count, Some(3));
        assert_eq!(sink.completed(), tests);
        assert!(!sink.has_run_failure());
        assert_eq!(*sink.events.last().unwrap(), TestEvent::RunEnded);
        assert_eq!(controller.runner.run_filters, vec![None]);
    }

    #[tokio::test]
    async fn test_empty_collection_is_empty_run() {
        let runner = ScriptedRunner::new(Vec::new(), Vec::new());
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.expected, 0);
        assert_eq!(outcome.attempts_used, 0);
        assert_eq!(sink.expected_count, Some(0));
        assert!(sink.run_ended);
        assert!(controller.runner.run_filters.is_empty());
    }

    #[tokio::test]
    async fn test_hung_batch_escalates_to_serial() {
        // Both tests start but never end, twice in a row; the serial sweep
        // then completes each one individually.
        let tests = vec![t("t1"), t("t2")];
        let hang: Vec<Action> = tests.iter().cloned().map(Action::StartOnly).collect();
        let runner = ScriptedRunner::new(tests.clone(), vec![hang.clone(), hang]);
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(controller.runner.run_filters.len(), 2);
        assert_eq!(
            controller.runner.run_filters[1],
            Some(vec!["A#t1".to_string(), "A#t2".to_string()])
        );
        assert_eq!(controller.runner.single_calls, tests.clone());

        // Each test ends exactly once in the reconciled stream.
        assert_eq!(sink.completed(), tests);
        let end_count = sink
            .events
            .iter()
            .filter(|e| matches!(e, TestEvent::TestEnded(_)))
            .count();
        assert_eq!(end_count, 2);
        assert_no_duplicate_starts(&sink);
    }

    #[tokio::test]
    async fn test_budget_caps_attempts_with_sliding_progress() {
        // Every attempt completes exactly one test and leaves the next one
        // started but unfinished; the budget stops the loop after three.
        let tests: Vec<_> = (1..=6).map(|i| t(&format!("t{}", i))).collect();
        let scripts = vec![
            vec![
                Action::Complete(t("t1")),
                Action::StartOnly(t("t2")),
            ],
            vec![
                Action::Complete(t("t2")),
                Action::StartOnly(t("t3")),
            ],
            vec![
                Action::Complete(t("t3")),
                Action::StartOnly(t("t4")),
            ],
        ];
        let runner = ScriptedRunner::new(tests, scripts);
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(outcome.completed, 3);
        assert!(!outcome.is_complete());
        assert_eq!(controller.runner.run_filters.len(), 3);
        assert!(controller.runner.single_calls.is_empty());
        assert_eq!(sink.completed(), vec![t("t1"), t("t2"), t("t3")]);
        // t4 started but never ended; the run still terminates cleanly.
        assert!(sink.started().contains(&t("t4")));
        assert!(sink.run_ended);
        assert!(!sink.has_run_failure());
        assert_no_duplicate_starts(&sink);
    }

    #[tokio::test]
    async fn test_rerun_only_forwards_remaining_tests() {
        // The rerun also replays t1, which already completed; those events
        // must not reach the reconciled stream again.
        let tests = vec![t("t1"), t("t2")];
        let scripts = vec![
            vec![Action::Complete(t("t1")), Action::StartOnly(t("t2"))],
            vec![Action::Complete(t("t1")), Action::Complete(t("t2"))],
        ];
        let runner = ScriptedRunner::new(tests.clone(), scripts);
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.completed, 2);
        assert_eq!(controller.runner.run_filters[1], Some(vec!["A#t2".to_string()]));
        let t1_ends = sink
            .events
            .iter()
            .filter(|e| matches!(e, TestEvent::TestEnded(test) if *test == t("t1")))
            .count();
        assert_eq!(t1_ends, 1);
        assert_no_duplicate_starts(&sink);
    }

    #[tokio::test]
    async fn test_parameterized_names_normalized_in_filter() {
        let tests = vec![
            TestIdentity::new("A", "m[0]"),
            TestIdentity::new("A", "m[1]"),
            t("x"),
        ];
        let scripts = vec![
            vec![
                Action::Complete(t("x")),
                Action::StartOnly(TestIdentity::new("A", "m[0]")),
                Action::StartOnly(TestIdentity::new("A", "m[1]")),
            ],
            // The rerun reports the base name only.
            vec![Action::Complete(t("m"))],
        ];
        let runner = ScriptedRunner::new(tests, scripts);
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        // Base name appears once in the filter, de-duplicated.
        assert_eq!(controller.runner.run_filters[1], Some(vec!["A#m".to_string()]));
        // Both parameterized variants are accounted complete via the base.
        assert_eq!(outcome.attempts_used, 2);
        assert!(sink.completed().contains(&t("m")));
    }

    #[tokio::test]
    async fn test_crash_without_any_start_reports_original_diagnostic() {
        let tests = vec![t("t1"), t("t2")];
        let scripts = vec![
            vec![Action::RunFailed("Instrumentation run failed due to process crash")],
            vec![Action::RunFailed("Instrumentation run failed again")],
        ];
        let runner = ScriptedRunner::new(tests, scripts);
        let mut controller = ShardController::new(runner, "shard-0", 2);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(
            sink.run_failures,
            vec!["Instrumentation run failed due to process crash".to_string()]
        );
        assert_eq!(*sink.events.last().unwrap(), TestEvent::RunEnded);
    }

    #[tokio::test]
    async fn test_transport_fatal_propagates_without_run_ended() {
        let tests = vec![t("t1")];
        let mut runner = ScriptedRunner::new(tests, Vec::new());
        runner.transport_dead = true;
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let err = controller.execute(&mut sink).await.unwrap_err();

        assert!(matches!(err, RunnerError::Transport(_)));
        // run_started was already announced; nothing terminated the stream.
        assert_eq!(sink.expected_count, Some(1));
        assert!(!sink.run_ended);
    }

    #[tokio::test]
    async fn test_run_failure_with_partial_progress_still_reruns_remainder() {
        // One attempt both completes a test and reports a run-level failure;
        // the remaining test is rerun and the diagnostic does not surface
        // because tests did start.
        let tests = vec![t("t1"), t("t2")];
        let scripts = vec![
            vec![
                Action::Complete(t("t1")),
                Action::RunFailed("process crashed after t1"),
            ],
            vec![Action::Complete(t("t2"))],
        ];
        let runner = ScriptedRunner::new(tests.clone(), scripts);
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(controller.runner.run_filters[1], Some(vec!["A#t2".to_string()]));
        assert_eq!(sink.completed(), tests);
        assert!(!sink.has_run_failure());
    }

    #[tokio::test]
    async fn test_serial_run_failures_report_first_diagnostic() {
        // Every invocation crashes before starting anything, batch and
        // serial alike; the caller gets the original diagnostic once.
        let tests = vec![t("t1"), t("t2")];
        let crash = vec![Action::RunFailed("instrumentation crashed")];
        let mut runner = ScriptedRunner::new(tests, vec![crash.clone(), crash]);
        runner.single_run_failed = Some("instrumentation crashed again");
        let mut controller = ShardController::new(runner, "shard-0", 3);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(controller.runner.single_calls.len(), 2);
        assert_eq!(sink.run_failures, vec!["instrumentation crashed".to_string()]);
        assert_eq!(*sink.events.last().unwrap(), TestEvent::RunEnded);
    }

    #[tokio::test]
    async fn test_serial_sweep_drops_persistent_stragglers() {
        let tests = vec![t("t1"), t("t2")];
        let hang: Vec<Action> = tests.iter().cloned().map(Action::StartOnly).collect();
        let mut runner = ScriptedRunner::new(tests, vec![hang.clone(), hang]);
        runner.single_succeeds = false;
        let mut controller = ShardController::new(runner, "shard-0", 5);

        let mut sink = CollectingSink::new();
        let outcome = controller.execute(&mut sink).await.unwrap();

        // Batch, stalled rerun, one serial sweep; the stragglers are dropped
        // rather than retried forever.
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(outcome.completed, 0);
        assert_eq!(controller.runner.single_calls.len(), 2);
        assert!(sink.run_ended);
    }
}
