//! Console reporting.
//!
//! [`ConsoleSink`] renders the lifecycle event stream for a terminal: one
//! line per completed test, run-level failures as they arrive, and a
//! summary when the run ends. Attach it alongside other sinks through
//! [`MultiSink`](crate::events::MultiSink) when machine-readable output is
//! also needed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::events::{Metrics, TestEventSink, TestIdentity};

/// Terminal outcome for one test, resolved at `test_ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Passed,
    Failed,
    Skipped,
}

/// A sink that prints progress and a summary to the console.
pub struct ConsoleSink {
    verbose: bool,
    run_name: String,
    expected: usize,
    passed: usize,
    failed: Vec<(TestIdentity, String)>,
    skipped: usize,
    run_failures: Vec<String>,
    /// Terminal outcome reported for a still-open test, consumed by
    /// `test_ended`.
    pending: HashMap<TestIdentity, Verdict>,
    pending_traces: HashMap<TestIdentity, String>,
}

impl ConsoleSink {
    /// Create a console sink. Verbose mode prints passing tests too.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            run_name: String::new(),
            expected: 0,
            passed: 0,
            failed: Vec::new(),
            skipped: 0,
            run_failures: Vec::new(),
            pending: HashMap::new(),
            pending_traces: HashMap::new(),
        }
    }

    fn completed(&self) -> usize {
        self.passed + self.failed.len() + self.skipped
    }
}

impl TestEventSink for ConsoleSink {
    fn run_started(&mut self, run_name: &str, expected_count: usize) {
        self.run_name = run_name.to_string();
        self.expected = expected_count;
        println!(
            "{} {} ({} tests)",
            console::style("Running").cyan().bold(),
            run_name,
            expected_count
        );
    }

    fn test_started(&mut self, test: &TestIdentity, _timestamp: Option<DateTime<Utc>>) {
        if self.verbose {
            println!("Running: {}", test);
        }
    }

    fn test_failed(&mut self, test: &TestIdentity, trace: &str) {
        self.pending.insert(test.clone(), Verdict::Failed);
        self.pending_traces.insert(test.clone(), trace.to_string());
    }

    fn test_assumption_failure(&mut self, test: &TestIdentity, trace: &str) {
        // An inapplicable environment is reported like a skip, with the
        // reason preserved in verbose mode.
        self.pending.insert(test.clone(), Verdict::Skipped);
        if self.verbose {
            println!("  {} {}", console::style("assumption:").dim(), trace);
        }
    }

    fn test_ignored(&mut self, test: &TestIdentity) {
        self.pending.insert(test.clone(), Verdict::Skipped);
    }

    fn test_ended(&mut self, test: &TestIdentity, _timestamp: Option<DateTime<Utc>>, _metrics: &Metrics) {
        let verdict = self.pending.remove(test).unwrap_or(Verdict::Passed);
        match verdict {
            Verdict::Passed => {
                self.passed += 1;
                if self.verbose {
                    println!("{} {}", console::style("PASS").green(), test);
                }
            }
            Verdict::Failed => {
                let trace = self.pending_traces.remove(test).unwrap_or_default();
                println!("{} {}", console::style("FAIL").red(), test);
                self.failed.push((test.clone(), trace));
            }
            Verdict::Skipped => {
                self.skipped += 1;
                if self.verbose {
                    println!("{} {}", console::style("SKIP").yellow(), test);
                }
            }
        }
    }

    fn run_failed(&mut self, message: &str) {
        println!(
            "{} {}",
            console::style("RUN FAILED").red().bold(),
            message.lines().next().unwrap_or(message)
        );
        self.run_failures.push(message.to_string());
    }

    fn run_ended(&mut self, elapsed: Duration, _metrics: &Metrics) {
        let missing = self.expected.saturating_sub(self.completed());

        println!();
        println!("Test Results: {}", self.run_name);
        println!("  Expected: {}", self.expected);
        println!("  Passed:   {}", console::style(self.passed).green());
        println!("  Failed:   {}", console::style(self.failed.len()).red());
        println!("  Skipped:  {}", console::style(self.skipped).yellow());

        if missing > 0 {
            println!("  Missing:  {}", console::style(missing).red().bold());
        }

        println!("  Duration: {:?}", elapsed);

        if self.failed.is_empty() && missing == 0 && self.run_failures.is_empty() {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!();
            println!("{}", console::style("Some tests did not pass.").red().bold());

            if !self.failed.is_empty() {
                println!();
                println!("Failed tests:");
                for (test, trace) in &self.failed {
                    println!("  - {}", test);
                    if let Some(first) = trace.lines().next() {
                        println!("    {}", console::style(first).dim());
                    }
                }
            }
            if !self.run_failures.is_empty() {
                println!();
                println!("Run failures:");
                for message in &self.run_failures {
                    println!("  - {}", message.lines().next().unwrap_or(message));
                }
            }
        }
    }
}
