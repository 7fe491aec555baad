//! Remote runner contracts.
//!
//! A [`RemoteRunner`] is the narrow channel to one remote target (device,
//! emulator, or local process): it can enumerate the expected test set and
//! execute it, driving parsed lifecycle events into a caller-supplied sink.
//! One command is in flight on a channel at a time; the controller never
//! issues concurrent calls on the same runner.
//!
//! Every `Err` a runner returns is transport-fatal: the channel itself is
//! unusable and the controller will not retry. Recoverable conditions
//! (process crash, hang-then-timeout, malformed output) are expressed as
//! `run_failed` events on the sink instead.

pub mod process;

use std::io::Write;

use async_trait::async_trait;

use crate::events::{ExpectedTestSet, TestEventSink, TestIdentity};

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Transport-fatal errors: the remote channel is unusable.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Remote channel unusable: {0}")]
    Transport(String),

    #[error("Failed to launch test process: {0}")]
    LaunchFailed(String),

    #[error("Failed to collect expected test set: {0}")]
    CollectFailed(String),

    #[error("Failed to materialize rerun filter: {0}")]
    FilterArtifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A set of tests to restrict a rerun to.
///
/// Entries are base-name-normalized (parameter indices stripped) and
/// de-duplicated, preserving first-seen order. The filter materializes as a
/// file of `scope#name` lines placed somewhere the remote runner can read;
/// the artifact is removed when dropped, after the rerun invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerunFilter {
    entries: Vec<TestIdentity>,
}

impl RerunFilter {
    /// Build a filter from the given tests, normalizing and de-duplicating.
    pub fn new(tests: impl IntoIterator<Item = TestIdentity>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let entries = tests
            .into_iter()
            .map(|t| t.rerun_key())
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self { entries }
    }

    /// Filter entries in order.
    pub fn entries(&self) -> &[TestIdentity] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the filter is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the filter admits `test`, matching on the rerun key.
    pub fn contains(&self, test: &TestIdentity) -> bool {
        let key = test.rerun_key();
        self.entries.iter().any(|e| *e == key)
    }

    /// Write the filter to a temporary file, one `scope#name` line per
    /// entry. The file is deleted when the returned handle drops.
    pub fn materialize(&self) -> RunnerResult<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| RunnerError::FilterArtifact(e.to_string()))?;
        for entry in &self.entries {
            writeln!(file, "{}", entry).map_err(|e| RunnerError::FilterArtifact(e.to_string()))?;
        }
        file.flush()
            .map_err(|e| RunnerError::FilterArtifact(e.to_string()))?;
        Ok(file)
    }
}

/// The channel to one remote target.
///
/// `run` and `run_single` drive parsed events into `sink` and return only
/// when the remote invocation has finished; they return `Err` only for
/// transport-fatal conditions.
#[async_trait]
pub trait RemoteRunner: Send {
    /// Enumerate the expected test set without executing (dry run).
    async fn collect(&mut self) -> RunnerResult<ExpectedTestSet>;

    /// Execute tests, restricted to `filter` when given; an absent filter
    /// means "run everything".
    async fn run(
        &mut self,
        filter: Option<&RerunFilter>,
        sink: &mut dyn TestEventSink,
    ) -> RunnerResult<()>;

    /// Execute exactly one test. The default implementation runs with a
    /// single-entry filter.
    async fn run_single(
        &mut self,
        test: &TestIdentity,
        sink: &mut dyn TestEventSink,
    ) -> RunnerResult<()> {
        let filter = RerunFilter::new([test.clone()]);
        self.run(Some(&filter), sink).await
    }

    /// Runner name, for logging.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_normalizes_and_dedupes() {
        let filter = RerunFilter::new(vec![
            TestIdentity::new("A", "m[0]"),
            TestIdentity::new("A", "m[1]"),
            TestIdentity::new("A", "x"),
            TestIdentity::new("B", "m[0]"),
        ]);

        let entries: Vec<_> = filter.entries().iter().map(|e| e.to_string()).collect();
        assert_eq!(entries, vec!["A#m", "A#x", "B#m"]);
    }

    #[test]
    fn test_filter_contains_matches_parameterized_variants() {
        let filter = RerunFilter::new(vec![TestIdentity::new("A", "m[0]")]);

        assert!(filter.contains(&TestIdentity::new("A", "m[3]")));
        assert!(filter.contains(&TestIdentity::new("A", "m")));
        assert!(!filter.contains(&TestIdentity::new("A", "n")));
    }

    #[test]
    fn test_materialize_writes_one_line_per_entry() {
        let filter = RerunFilter::new(vec![
            TestIdentity::new("A", "m"),
            TestIdentity::new("B", "n"),
        ]);

        let file = filter.materialize().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "A#m\nB#n\n");

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists(), "artifact should be removed after use");
    }
}
