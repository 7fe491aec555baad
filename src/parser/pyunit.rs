//! Tokenizer for interpreted-language unit-test output (Python unittest
//! verbose framing).
//!
//! Result lines arrive first (`test_a (module.Class) ... ok`); failure
//! tracebacks follow in a trailer, one block per failed test, delimited by
//! `===`/`---` rules. The declared count only appears at the very end
//! (`Ran N tests in ...`), so count reconciliation happens at flush.

use regex::Regex;

use super::{Completion, Token, Tokenizer};
use crate::events::{Metrics, TestIdentity};

/// Tokenizer for Python unittest verbose output.
pub struct PyUnitTokenizer {
    result: Regex,
    trailer: Regex,
    ran: Regex,
    /// A `FailureCapture` was just emitted; the next dashed rule opens the
    /// traceback rather than closing a capture.
    opener_pending: bool,
}

impl Default for PyUnitTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PyUnitTokenizer {
    /// Create a new tokenizer.
    pub fn new() -> Self {
        Self {
            result: Regex::new(r"^(\w+) \(([\w.]+)\)\s*\.\.\.\s*(.+)$").unwrap(),
            trailer: Regex::new(r"^(FAIL|ERROR): (\w+) \(([\w.]+)\)$").unwrap(),
            ran: Regex::new(r"^Ran (\d+) tests? in ").unwrap(),
            opener_pending: false,
        }
    }

    fn is_rule(line: &str, ch: char) -> bool {
        line.len() >= 10 && line.chars().all(|c| c == ch)
    }
}

impl Tokenizer for PyUnitTokenizer {
    fn tokenize(&mut self, line: &str) -> Token {
        let trimmed = line.trim_end();

        if Self::is_rule(trimmed, '=') {
            self.opener_pending = false;
            return Token::CaptureEnd;
        }

        if Self::is_rule(trimmed, '-') {
            if self.opener_pending {
                self.opener_pending = false;
                return Token::Ignore;
            }
            return Token::CaptureEnd;
        }

        if let Some(caps) = self.trailer.captures(trimmed) {
            let test = TestIdentity::new(&caps[3], &caps[2]);
            self.opener_pending = true;
            return Token::FailureCapture(test);
        }

        if let Some(caps) = self.ran.captures(trimmed) {
            return Token::Summary(caps[1].parse().ok());
        }

        if trimmed == "OK" || trimmed.starts_with("OK (") || trimmed.starts_with("FAILED (") {
            return Token::Summary(None);
        }

        if let Some(caps) = self.result.captures(trimmed) {
            let test = TestIdentity::new(&caps[2], &caps[1]);
            let status = caps[3].trim();
            return match status {
                "ok" => Token::TestComplete(test, Completion::Pass, Metrics::new(), String::new()),
                // The traceback arrives later in the trailer; only mark the
                // start here.
                "FAIL" | "ERROR" => Token::TestStart(test),
                "expected failure" => {
                    Token::TestComplete(test, Completion::ExpectedFailure, Metrics::new(), String::new())
                }
                "unexpected success" => {
                    Token::TestComplete(test, Completion::UnexpectedSuccess, Metrics::new(), String::new())
                }
                s if s.starts_with("skipped") => {
                    Token::TestComplete(test, Completion::Skip, Metrics::new(), String::new())
                }
                _ => Token::Text,
            };
        }

        Token::Text
    }

    fn name(&self) -> &'static str {
        "pyunit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingSink, TestEvent};
    use crate::parser::ResultParser;

    fn parse(lines: &[&str]) -> CollectingSink {
        let mut sink = CollectingSink::new();
        let mut parser = ResultParser::new("pyunit", Box::new(PyUnitTokenizer::new()), &mut sink);
        parser.process_new_lines(lines);
        parser.flush();
        sink
    }

    #[test]
    fn test_mixed_outcomes() {
        let sink = parse(&[
            "test_a (tests.test_mod.TestClass) ... ok",
            "test_b (tests.test_mod.TestClass) ... FAIL",
            "test_c (tests.test_mod.TestClass) ... skipped 'not supported here'",
            "test_d (tests.test_mod.TestClass) ... expected failure",
            "test_e (tests.test_mod.TestClass) ... unexpected success",
            "",
            "======================================================================",
            "FAIL: test_b (tests.test_mod.TestClass)",
            "----------------------------------------------------------------------",
            "Traceback (most recent call last):",
            "  File \"tests/test_mod.py\", line 12, in test_b",
            "AssertionError: 1 != 2",
            "",
            "----------------------------------------------------------------------",
            "Ran 5 tests in 0.004s",
            "",
            "FAILED (failures=1, skipped=1, expected failures=1, unexpected successes=1)",
        ]);

        assert_eq!(sink.completed().len(), 5);
        assert_eq!(
            sink.ignored(),
            vec![TestIdentity::new("tests.test_mod.TestClass", "test_c")]
        );
        // test_b (traceback) and test_e (unexpected success) both fail.
        assert_eq!(sink.failed().len(), 2);
        assert!(!sink.has_run_failure());
        assert!(sink.run_ended);
    }

    #[test]
    fn test_traceback_attributed_to_failed_test() {
        let sink = parse(&[
            "test_b (tests.test_mod.TestClass) ... FAIL",
            "",
            "======================================================================",
            "FAIL: test_b (tests.test_mod.TestClass)",
            "----------------------------------------------------------------------",
            "Traceback (most recent call last):",
            "AssertionError: 1 != 2",
            "",
            "----------------------------------------------------------------------",
            "Ran 1 test in 0.001s",
        ]);

        let trace = sink
            .events
            .iter()
            .find_map(|e| match e {
                TestEvent::TestFailed(t, trace)
                    if t.name == "test_b" =>
                {
                    Some(trace.clone())
                }
                _ => None,
            })
            .expect("test_b should have failed");
        assert!(trace.starts_with("Traceback"));
        assert!(trace.contains("AssertionError: 1 != 2"));
    }

    #[test]
    fn test_error_block_reported_as_failure() {
        let sink = parse(&[
            "test_f (tests.test_mod.TestClass) ... ERROR",
            "",
            "======================================================================",
            "ERROR: test_f (tests.test_mod.TestClass)",
            "----------------------------------------------------------------------",
            "Traceback (most recent call last):",
            "ZeroDivisionError: division by zero",
            "",
            "----------------------------------------------------------------------",
            "Ran 1 test in 0.001s",
        ]);

        assert_eq!(sink.failed().len(), 1);
        assert_eq!(sink.completed().len(), 1);
        assert!(!sink.has_run_failure());
    }

    #[test]
    fn test_class_setup_error_synthesizes_failing_test() {
        // setUpClass failures produce only a trailer block, no result line;
        // the block becomes a synthetic started/failed/ended triple.
        let sink = parse(&[
            "======================================================================",
            "ERROR: setUpClass (tests.test_mod.TestClass)",
            "----------------------------------------------------------------------",
            "Traceback (most recent call last):",
            "RuntimeError: database unavailable",
            "",
            "----------------------------------------------------------------------",
            "Ran 0 tests in 0.000s",
        ]);

        let synthetic = TestIdentity::new("tests.test_mod.TestClass", "setUpClass");
        assert!(matches!(
            sink.events.first(),
            Some(TestEvent::RunStarted { .. })
        ));
        assert_eq!(sink.started(), vec![synthetic.clone()]);
        assert_eq!(sink.failed(), vec![synthetic.clone()]);
        assert_eq!(sink.completed(), vec![synthetic]);

        let trace = sink
            .events
            .iter()
            .find_map(|e| match e {
                TestEvent::TestFailed(_, trace) => Some(trace.clone()),
                _ => None,
            })
            .expect("setUpClass should have failed");
        assert!(trace.contains("RuntimeError: database unavailable"));

        // Declared count (0) vs the synthetic completion still flags the run.
        assert_eq!(sink.run_failures, vec!["Expected 0 tests, received 1"]);
        assert!(sink.run_ended);
    }

    #[test]
    fn test_declared_count_mismatch() {
        // Trailer claims seven tests but only six result lines made it out.
        let mut lines: Vec<String> = (0..6)
            .map(|i| format!("test_{} (tests.test_mod.TestClass) ... ok", i))
            .collect();
        lines.push("----------------------------------------------------------------------".into());
        lines.push("Ran 7 tests in 0.010s".into());
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let sink = parse(&refs);

        assert_eq!(sink.completed().len(), 6);
        assert_eq!(sink.run_failures, vec!["Expected 7 tests, received 6"]);
        assert!(sink.run_ended);
    }

    #[test]
    fn test_fail_without_trailer_leaves_test_unended() {
        let sink = parse(&[
            "test_a (tests.test_mod.TestClass) ... ok",
            "test_b (tests.test_mod.TestClass) ... FAIL",
        ]);

        assert_eq!(sink.started().len(), 2);
        assert_eq!(sink.completed().len(), 1);
        assert_eq!(sink.run_failures, vec!["Expected 2 tests, received 1"]);
    }
}
