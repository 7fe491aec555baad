//! The canonical test lifecycle protocol.
//!
//! Every producer in the harness (result parsers, the execution controller)
//! emits into a [`TestEventSink`], and every consumer (console reporting,
//! aggregation, the controller's own completion tracking) observes the same
//! protocol. Events are fire-and-forget and ordered per producer.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric value attached to a test or run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Human-readable metric (e.g. a duration or counter rendered as text).
    Text(String),
    /// Opaque binary payload (e.g. a profiling snapshot).
    Blob(Vec<u8>),
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        MetricValue::Text(s.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(s: String) -> Self {
        MetricValue::Text(s)
    }
}

/// Metrics reported alongside `test_ended` / `run_ended`.
pub type Metrics = HashMap<String, MetricValue>;

/// Identifies a single test: a fully-qualified group scope plus a local name.
///
/// Equality is structural. A parameterized test carries a bracketed index in
/// its name (`method[0]`); [`TestIdentity::rerun_key`] collapses that to the
/// base name, because parameter indices are not stable across re-collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestIdentity {
    /// Fully-qualified group identifier (class or suite name).
    pub scope: String,
    /// Local test name, possibly with a bracketed parameter index.
    pub name: String,
}

impl TestIdentity {
    /// Create a new test identity.
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// The test name with any bracketed parameter index stripped.
    pub fn base_name(&self) -> &str {
        match self.name.find('[') {
            Some(idx) => &self.name[..idx],
            None => &self.name,
        }
    }

    /// Whether the name carries a bracketed parameter index.
    pub fn is_parameterized(&self) -> bool {
        self.name.ends_with(']') && self.name.contains('[')
    }

    /// The identity used as a rerun filter key: same scope, base name.
    pub fn rerun_key(&self) -> TestIdentity {
        TestIdentity::new(&self.scope, self.base_name())
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scope, self.name)
    }
}

/// An ordered, duplicate-free set of test identities with a declared count.
///
/// Established once per shard by a collection pass (or static enumeration)
/// and immutable for the life of that shard's execution; all rerun accounting
/// is relative to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedTestSet {
    tests: Vec<TestIdentity>,
}

impl ExpectedTestSet {
    /// Build an expected set, dropping duplicates while preserving order.
    pub fn new(tests: impl IntoIterator<Item = TestIdentity>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let tests = tests
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self { tests }
    }

    /// Declared number of tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Iterate in declared order.
    pub fn iter(&self) -> impl Iterator<Item = &TestIdentity> {
        self.tests.iter()
    }

    /// Membership check.
    pub fn contains(&self, test: &TestIdentity) -> bool {
        self.tests.iter().any(|t| t == test)
    }
}

/// Receives the canonical test lifecycle events.
///
/// Producers guarantee: every `test_started` is eventually paired with exactly
/// one `test_ended`; a terminal outcome (`test_failed`, `test_ignored`,
/// `test_assumption_failure`) is immediately followed by that `test_ended`;
/// no `test_started` after `run_ended`; exactly one `run_ended` per
/// `run_started`. `run_failed` may occur any number of times within a run and
/// signals that the run itself (not a specific test) is compromised.
///
/// All methods have no-op defaults so consumers implement only what they
/// observe.
pub trait TestEventSink: Send {
    /// A run of `expected_count` tests is starting.
    fn run_started(&mut self, _run_name: &str, _expected_count: usize) {}

    /// A single test began executing.
    fn test_started(&mut self, _test: &TestIdentity, _timestamp: Option<DateTime<Utc>>) {}

    /// The current test failed; `trace` is the captured failure text.
    fn test_failed(&mut self, _test: &TestIdentity, _trace: &str) {}

    /// The current test violated an assumption (environment not applicable).
    fn test_assumption_failure(&mut self, _test: &TestIdentity, _trace: &str) {}

    /// The current test was skipped.
    fn test_ignored(&mut self, _test: &TestIdentity) {}

    /// A single test finished; always emitted, whatever the outcome.
    fn test_ended(&mut self, _test: &TestIdentity, _timestamp: Option<DateTime<Utc>>, _metrics: &Metrics) {}

    /// The run is compromised (crash, truncated output, count mismatch).
    fn run_failed(&mut self, _message: &str) {}

    /// The run finished; terminates the event stream for this run.
    fn run_ended(&mut self, _elapsed: Duration, _metrics: &Metrics) {}
}

/// A sink that discards all events.
pub struct NullSink;

impl TestEventSink for NullSink {}

/// Fans events out to multiple sinks in registration order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn TestEventSink>>,
}

impl MultiSink {
    /// Create an empty multi-sink.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink.
    pub fn with_sink<S: TestEventSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl TestEventSink for MultiSink {
    fn run_started(&mut self, run_name: &str, expected_count: usize) {
        for sink in &mut self.sinks {
            sink.run_started(run_name, expected_count);
        }
    }

    fn test_started(&mut self, test: &TestIdentity, timestamp: Option<DateTime<Utc>>) {
        for sink in &mut self.sinks {
            sink.test_started(test, timestamp);
        }
    }

    fn test_failed(&mut self, test: &TestIdentity, trace: &str) {
        for sink in &mut self.sinks {
            sink.test_failed(test, trace);
        }
    }

    fn test_assumption_failure(&mut self, test: &TestIdentity, trace: &str) {
        for sink in &mut self.sinks {
            sink.test_assumption_failure(test, trace);
        }
    }

    fn test_ignored(&mut self, test: &TestIdentity) {
        for sink in &mut self.sinks {
            sink.test_ignored(test);
        }
    }

    fn test_ended(&mut self, test: &TestIdentity, timestamp: Option<DateTime<Utc>>, metrics: &Metrics) {
        for sink in &mut self.sinks {
            sink.test_ended(test, timestamp, metrics);
        }
    }

    fn run_failed(&mut self, message: &str) {
        for sink in &mut self.sinks {
            sink.run_failed(message);
        }
    }

    fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        for sink in &mut self.sinks {
            sink.run_ended(elapsed, metrics);
        }
    }
}

/// A recorded lifecycle event, for inspection after the fact.
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    RunStarted { name: String, expected: usize },
    TestStarted(TestIdentity),
    TestFailed(TestIdentity, String),
    AssumptionFailure(TestIdentity, String),
    TestIgnored(TestIdentity),
    TestEnded(TestIdentity),
    RunFailed(String),
    RunEnded,
}

/// A sink that records everything it observes.
///
/// The controller interposes one of these on every runner invocation to
/// account for which tests started and completed; tests use it to assert on
/// event order.
#[derive(Default)]
pub struct CollectingSink {
    /// All events in arrival order.
    pub events: Vec<TestEvent>,
    /// Declared run name, if a run started.
    pub run_name: Option<String>,
    /// Declared expected count, if a run started.
    pub expected_count: Option<usize>,
    /// Run-level failure messages, in order.
    pub run_failures: Vec<String>,
    /// Whether `run_ended` was observed.
    pub run_ended: bool,
}

impl CollectingSink {
    /// Create an empty collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities that started, in first-start order, duplicate-free.
    pub fn started(&self) -> Vec<TestIdentity> {
        let mut seen = std::collections::HashSet::new();
        self.events
            .iter()
            .filter_map(|e| match e {
                TestEvent::TestStarted(t) if seen.insert(t.clone()) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Identities that ended, in first-end order, duplicate-free.
    pub fn completed(&self) -> Vec<TestIdentity> {
        let mut seen = std::collections::HashSet::new();
        self.events
            .iter()
            .filter_map(|e| match e {
                TestEvent::TestEnded(t) if seen.insert(t.clone()) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Identities that failed.
    pub fn failed(&self) -> Vec<TestIdentity> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TestEvent::TestFailed(t, _) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Identities that were ignored.
    pub fn ignored(&self) -> Vec<TestIdentity> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TestEvent::TestIgnored(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether any run-level failure was reported.
    pub fn has_run_failure(&self) -> bool {
        !self.run_failures.is_empty()
    }
}

impl TestEventSink for CollectingSink {
    fn run_started(&mut self, run_name: &str, expected_count: usize) {
        self.run_name = Some(run_name.to_string());
        self.expected_count = Some(expected_count);
        self.events.push(TestEvent::RunStarted {
            name: run_name.to_string(),
            expected: expected_count,
        });
    }

    fn test_started(&mut self, test: &TestIdentity, _timestamp: Option<DateTime<Utc>>) {
        self.events.push(TestEvent::TestStarted(test.clone()));
    }

    fn test_failed(&mut self, test: &TestIdentity, trace: &str) {
        self.events
            .push(TestEvent::TestFailed(test.clone(), trace.to_string()));
    }

    fn test_assumption_failure(&mut self, test: &TestIdentity, trace: &str) {
        self.events
            .push(TestEvent::AssumptionFailure(test.clone(), trace.to_string()));
    }

    fn test_ignored(&mut self, test: &TestIdentity) {
        self.events.push(TestEvent::TestIgnored(test.clone()));
    }

    fn test_ended(&mut self, test: &TestIdentity, _timestamp: Option<DateTime<Utc>>, _metrics: &Metrics) {
        self.events.push(TestEvent::TestEnded(test.clone()));
    }

    fn run_failed(&mut self, message: &str) {
        self.run_failures.push(message.to_string());
        self.events.push(TestEvent::RunFailed(message.to_string()));
    }

    fn run_ended(&mut self, _elapsed: Duration, _metrics: &Metrics) {
        self.run_ended = true;
        self.events.push(TestEvent::RunEnded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_strips_parameter_index() {
        let t = TestIdentity::new("com.example.FooTest", "testBar[0]");
        assert_eq!(t.base_name(), "testBar");
        assert!(t.is_parameterized());
        assert_eq!(
            t.rerun_key(),
            TestIdentity::new("com.example.FooTest", "testBar")
        );
    }

    #[test]
    fn test_base_name_plain() {
        let t = TestIdentity::new("com.example.FooTest", "testBar");
        assert_eq!(t.base_name(), "testBar");
        assert!(!t.is_parameterized());
        assert_eq!(t.rerun_key(), t);
    }

    #[test]
    fn test_display_uses_hash_separator() {
        let t = TestIdentity::new("suite.Class", "method");
        assert_eq!(t.to_string(), "suite.Class#method");
    }

    #[test]
    fn test_expected_set_dedupes_preserving_order() {
        let set = ExpectedTestSet::new(vec![
            TestIdentity::new("A", "a"),
            TestIdentity::new("A", "b"),
            TestIdentity::new("A", "a"),
            TestIdentity::new("B", "a"),
        ]);
        assert_eq!(set.len(), 3);
        let names: Vec<_> = set.iter().map(|t| t.to_string()).collect();
        assert_eq!(names, vec!["A#a", "A#b", "B#a"]);
    }

    #[test]
    fn test_collecting_sink_records_order() {
        let mut sink = CollectingSink::new();
        let t1 = TestIdentity::new("A", "a");
        let t2 = TestIdentity::new("A", "b");

        sink.run_started("shard-0", 2);
        sink.test_started(&t1, None);
        sink.test_ended(&t1, None, &Metrics::new());
        sink.test_started(&t2, None);
        sink.test_failed(&t2, "assertion failed");
        sink.test_ended(&t2, None, &Metrics::new());
        sink.run_ended(Duration::from_secs(1), &Metrics::new());

        assert_eq!(sink.expected_count, Some(2));
        assert_eq!(sink.started(), vec![t1.clone(), t2.clone()]);
        assert_eq!(sink.completed(), vec![t1, t2.clone()]);
        assert_eq!(sink.failed(), vec![t2]);
        assert!(sink.run_ended);
        assert!(!sink.has_run_failure());
    }
}
