//! Streaming result parsing.
//!
//! Raw output from a test process arrives as an ordered, possibly incremental
//! sequence of lines. A format-specific [`Tokenizer`] classifies each line;
//! the shared [`ResultParser`] skeleton drives a [`TestEventSink`] from the
//! resulting token stream, tolerating truncation, noise, and declared-count
//! mismatches.

pub mod benchmark;
pub mod gtest;
pub mod pyunit;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{Metrics, TestEventSink, TestIdentity};

pub use benchmark::BenchmarkTokenizer;
pub use gtest::GtestTokenizer;
pub use pyunit::PyUnitTokenizer;

/// Selects which tokenizer interprets a runner's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Native test binaries with gtest-style bracketed framing.
    #[default]
    Gtest,
    /// Python unittest verbose output.
    Pyunit,
    /// JSON-per-line benchmark logs.
    Benchmark,
}

impl OutputFormat {
    /// Build a fresh tokenizer for this format.
    pub fn tokenizer(&self) -> Box<dyn Tokenizer> {
        match self {
            OutputFormat::Gtest => Box::new(GtestTokenizer::new()),
            OutputFormat::Pyunit => Box::new(PyUnitTokenizer::new()),
            OutputFormat::Benchmark => Box::new(BenchmarkTokenizer::new()),
        }
    }
}

/// How a test finished, as reported by the output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pass,
    Fail,
    Skip,
    /// The format marked this failure as expected; reported as a plain pass.
    ExpectedFailure,
    /// A test expected to fail passed instead; reported as a failure.
    UnexpectedSuccess,
}

/// Classification of a single output line.
#[derive(Debug, Clone)]
pub enum Token {
    /// A header declaring how many tests the run will execute.
    Header(usize),
    /// A test began executing.
    TestStart(TestIdentity),
    /// A previously-started test finished.
    TestFinished(TestIdentity, Completion, Metrics),
    /// A test started and finished on one line (single-line formats); the
    /// string carries any failure text the line itself reported.
    TestComplete(TestIdentity, Completion, Metrics, String),
    /// Begin capturing a multi-line failure message for the given test; the
    /// capture runs until the next non-text token.
    FailureCapture(TestIdentity),
    /// Explicit end of a multi-line capture.
    CaptureEnd,
    /// A run summary trailer, optionally carrying the declared test count
    /// for formats that only announce it at the end.
    Summary(Option<usize>),
    /// A top-level infrastructure error (e.g. dynamic-linker failure) that
    /// makes the rest of the stream meaningless.
    Fatal(String),
    /// Format framing with no semantic content.
    Ignore,
    /// Plain text; buffered if a failure capture or test is in progress.
    Text,
}

/// A format-specific line classifier.
///
/// Tokenizers may keep internal state (some formats need context to classify
/// delimiter lines) but must never emit events themselves; all sink traffic
/// goes through the shared skeleton.
pub trait Tokenizer: Send {
    /// Classify one line of output.
    fn tokenize(&mut self, line: &str) -> Token;

    /// Format name, for logging.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    AwaitingHeader,
    InRun,
    InTest,
    Capturing,
    Done,
}

/// The shared push-based parsing skeleton.
///
/// Feed lines with [`process_new_lines`](ResultParser::process_new_lines) as
/// output streams in, then call [`flush`](ResultParser::flush) exactly once
/// when the stream ends. `flush` resolves any still-open capture and reports
/// declared-vs-received count mismatches as a `run_failed` event.
pub struct ResultParser<'a> {
    tokenizer: Box<dyn Tokenizer>,
    sink: &'a mut dyn TestEventSink,
    run_name: String,
    mode: Mode,
    /// Tests started but not yet ended, in start order.
    open: Vec<TestIdentity>,
    /// Target of an in-progress multi-line failure capture.
    capture_target: Option<TestIdentity>,
    /// Buffered text lines for the current test or capture.
    buffer: Vec<String>,
    declared: Option<usize>,
    started: usize,
    completed: usize,
    run_started_emitted: bool,
    /// Raw log text from a side channel, appended to the diagnostic when no
    /// structured output is recognized at all.
    fallback_log: Option<String>,
    created_at: Instant,
}

impl<'a> ResultParser<'a> {
    /// Create a parser for one run's output.
    pub fn new(
        run_name: impl Into<String>,
        tokenizer: Box<dyn Tokenizer>,
        sink: &'a mut dyn TestEventSink,
    ) -> Self {
        Self {
            tokenizer,
            sink,
            run_name: run_name.into(),
            mode: Mode::AwaitingHeader,
            open: Vec::new(),
            capture_target: None,
            buffer: Vec::new(),
            declared: None,
            started: 0,
            completed: 0,
            run_started_emitted: false,
            fallback_log: None,
            created_at: Instant::now(),
        }
    }

    /// Attach raw log text to use in the diagnostic if the stream turns out
    /// to contain no structured output at all.
    pub fn set_fallback_log(&mut self, log: impl Into<String>) {
        self.fallback_log = Some(log.into());
    }

    /// Number of tests the format declared, if known yet.
    pub fn declared_count(&self) -> Option<usize> {
        self.declared
    }

    /// Number of tests that have ended so far.
    pub fn completed_count(&self) -> usize {
        self.completed
    }

    /// Feed a batch of lines.
    pub fn process_new_lines(&mut self, lines: &[&str]) {
        for line in lines {
            self.process_line(line);
        }
    }

    /// Feed one line.
    pub fn process_line(&mut self, line: &str) {
        if self.mode == Mode::Done {
            return;
        }

        let token = self.tokenizer.tokenize(line);
        match token {
            Token::Ignore => {}
            Token::Text => {
                if matches!(self.mode, Mode::InTest | Mode::Capturing) {
                    self.buffer.push(line.to_string());
                }
            }
            Token::Header(count) => {
                self.declared = Some(count);
                self.ensure_run_started(count);
                self.mode = Mode::InRun;
            }
            Token::TestStart(test) => {
                self.resolve_capture();
                let declared = self.declared.unwrap_or(0);
                self.ensure_run_started(declared);
                self.sink.test_started(&test, None);
                self.open.push(test);
                self.started += 1;
                self.buffer.clear();
                self.mode = Mode::InTest;
            }
            Token::TestFinished(test, completion, metrics) => {
                self.resolve_capture();
                if !self.open.contains(&test) {
                    // End without a matching start; synthesize the start so
                    // the pairing invariant holds.
                    let declared = self.declared.unwrap_or(0);
                    self.ensure_run_started(declared);
                    self.sink.test_started(&test, None);
                    self.started += 1;
                    self.open.push(test.clone());
                }
                let trace = self.take_buffer();
                self.emit_outcome(&test, completion, &trace, &metrics);
                self.mode = Mode::InRun;
            }
            Token::TestComplete(test, completion, metrics, trace) => {
                self.resolve_capture();
                let declared = self.declared.unwrap_or(0);
                self.ensure_run_started(declared);
                self.sink.test_started(&test, None);
                self.open.push(test.clone());
                self.started += 1;
                self.buffer.clear();
                self.emit_outcome(&test, completion, &trace, &metrics);
                self.mode = Mode::InRun;
            }
            Token::FailureCapture(test) => {
                self.resolve_capture();
                self.capture_target = Some(test);
                self.buffer.clear();
                self.mode = Mode::Capturing;
            }
            Token::CaptureEnd => {
                self.resolve_capture();
                self.mode = Mode::InRun;
            }
            Token::Summary(count) => {
                self.resolve_capture();
                if self.declared.is_none() {
                    self.declared = count;
                }
                self.mode = Mode::InRun;
            }
            Token::Fatal(message) => {
                debug!(format = self.tokenizer.name(), "fatal output line: {}", message);
                self.ensure_run_started(0);
                self.sink.run_failed(&message);
                self.sink
                    .run_ended(self.created_at.elapsed(), &Metrics::new());
                self.mode = Mode::Done;
            }
        }
    }

    /// Finalize the stream. Must be called exactly once, after the last line.
    pub fn flush(&mut self) {
        if self.mode == Mode::Done {
            return;
        }

        self.resolve_capture();

        if !self.run_started_emitted {
            // Nothing structured was recognized at all.
            let mut diagnostic =
                format!("Failed to parse any {} test output", self.tokenizer.name());
            if let Some(log) = &self.fallback_log {
                diagnostic.push_str(": ");
                diagnostic.push_str(log);
            }
            self.sink.run_started(&self.run_name, 0);
            self.sink.run_failed(&diagnostic);
        } else {
            let expected = self.declared.unwrap_or(self.started);
            if expected != self.completed {
                self.sink.run_failed(&format!(
                    "Expected {} tests, received {}",
                    expected, self.completed
                ));
            }
        }

        self.sink
            .run_ended(self.created_at.elapsed(), &Metrics::new());
        self.mode = Mode::Done;
    }

    fn ensure_run_started(&mut self, count: usize) {
        if !self.run_started_emitted {
            self.sink.run_started(&self.run_name, count);
            self.run_started_emitted = true;
        }
    }

    fn take_buffer(&mut self) -> String {
        let joined = self.buffer.join("\n");
        self.buffer.clear();
        joined.trim().to_string()
    }

    /// If a multi-line capture is open, emit its failure and end events.
    fn resolve_capture(&mut self) {
        if let Some(test) = self.capture_target.take() {
            let trace = self.take_buffer();
            if !self.open.contains(&test) {
                // A trailer block with no matching result line (e.g. a
                // class-level setup failure); synthesize the start so the
                // pairing invariant holds.
                let declared = self.declared.unwrap_or(0);
                self.ensure_run_started(declared);
                self.sink.test_started(&test, None);
                self.started += 1;
                self.open.push(test.clone());
            }
            self.emit_outcome(&test, Completion::Fail, &trace, &Metrics::new());
        }
    }

    fn emit_outcome(&mut self, test: &TestIdentity, completion: Completion, trace: &str, metrics: &Metrics) {
        match completion {
            Completion::Pass | Completion::ExpectedFailure => {}
            Completion::Fail => self.sink.test_failed(test, trace),
            Completion::Skip => self.sink.test_ignored(test),
            Completion::UnexpectedSuccess => self
                .sink
                .test_failed(test, "Test was expected to fail but passed"),
        }
        self.sink.test_ended(test, None, metrics);
        self.open.retain(|t| t != test);
        self.completed += 1;
    }
}
