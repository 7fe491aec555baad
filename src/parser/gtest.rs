//! Tokenizer for native test binary output (gtest-style framing).
//!
//! Recognizes the bracketed status lines emitted by googletest-compatible
//! binaries. Failure text is whatever appears between a `[ RUN      ]` line
//! and the matching `[  FAILED  ]` line.

use regex::Regex;

use super::{Completion, Token, Tokenizer};
use crate::events::{Metrics, TestIdentity};

/// Tokenizer for gtest-style native test output.
pub struct GtestTokenizer {
    header: Regex,
    run: Regex,
    ok: Regex,
    failed: Regex,
    skipped: Regex,
    summary: Regex,
    /// Set once the first framing line is seen; fatal loader errors are only
    /// recognized before that.
    seen_structure: bool,
    /// Set once the trailing summary is seen; the failed-test recap that
    /// follows it must not re-emit results.
    summary_seen: bool,
}

impl Default for GtestTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GtestTokenizer {
    /// Create a new tokenizer.
    pub fn new() -> Self {
        Self {
            header: Regex::new(r"^\[==========\] Running (\d+) tests? from \d+ test (?:suites?|cases?)")
                .unwrap(),
            run: Regex::new(r"^\[ RUN      \] (\S+)").unwrap(),
            ok: Regex::new(r"^\[       OK \] (\S+)(?: \((\d+) ms\))?").unwrap(),
            failed: Regex::new(r"^\[  FAILED  \] (\S+)(?: \((\d+) ms\))?").unwrap(),
            skipped: Regex::new(r"^\[  SKIPPED \] (\S+)(?: \((\d+) ms\))?").unwrap(),
            summary: Regex::new(r"^\[==========\] (\d+) tests? from .+ ran\.").unwrap(),
            seen_structure: false,
            summary_seen: false,
        }
    }

    fn identity(qualified: &str) -> Option<TestIdentity> {
        let (scope, name) = qualified.split_once('.')?;
        if scope.is_empty() || name.is_empty() {
            return None;
        }
        Some(TestIdentity::new(scope, name))
    }

    fn time_metrics(millis: Option<&str>) -> Metrics {
        let mut metrics = Metrics::new();
        if let Some(ms) = millis {
            metrics.insert("time_ms".to_string(), ms.into());
        }
        metrics
    }

    fn is_loader_failure(line: &str) -> bool {
        line.starts_with("CANNOT LINK EXECUTABLE")
            || line.contains("error while loading shared libraries")
            || line.starts_with("dlopen failed")
    }
}

impl Tokenizer for GtestTokenizer {
    fn tokenize(&mut self, line: &str) -> Token {
        let trimmed = line.trim_end();

        if !self.seen_structure && Self::is_loader_failure(trimmed) {
            return Token::Fatal(trimmed.to_string());
        }

        if let Some(caps) = self.header.captures(trimmed) {
            self.seen_structure = true;
            if let Ok(count) = caps[1].parse() {
                return Token::Header(count);
            }
            return Token::Ignore;
        }

        if let Some(caps) = self.summary.captures(trimmed) {
            self.seen_structure = true;
            self.summary_seen = true;
            return Token::Summary(caps[1].parse().ok());
        }

        // The recap after the summary repeats failed test names; swallow it.
        if self.summary_seen {
            return Token::Ignore;
        }

        if let Some(caps) = self.run.captures(trimmed) {
            self.seen_structure = true;
            if let Some(test) = Self::identity(&caps[1]) {
                return Token::TestStart(test);
            }
            return Token::Ignore;
        }

        if let Some(caps) = self.ok.captures(trimmed) {
            if let Some(test) = Self::identity(&caps[1]) {
                let metrics = Self::time_metrics(caps.get(2).map(|m| m.as_str()));
                return Token::TestFinished(test, Completion::Pass, metrics);
            }
            return Token::Ignore;
        }

        if let Some(caps) = self.failed.captures(trimmed) {
            if let Some(test) = Self::identity(&caps[1]) {
                let metrics = Self::time_metrics(caps.get(2).map(|m| m.as_str()));
                return Token::TestFinished(test, Completion::Fail, metrics);
            }
            // "[  FAILED  ] 1 test, listed below:" and similar.
            return Token::Ignore;
        }

        if let Some(caps) = self.skipped.captures(trimmed) {
            if let Some(test) = Self::identity(&caps[1]) {
                return Token::TestFinished(test, Completion::Skip, Metrics::new());
            }
            return Token::Ignore;
        }

        if trimmed.starts_with("[----------]") || trimmed.starts_with("[==========]") {
            return Token::Ignore;
        }

        Token::Text
    }

    fn name(&self) -> &'static str {
        "gtest"
    }
}
