//! Tokenizer for benchmark logs: one JSON object per line.
//!
//! A run opens with `{"count": N}`, each benchmark reports
//! `{"name": "Scope#case", "status": "...", "metrics": {...}}`, and the run
//! closes with `{"done": true}`. Lines that are not valid JSON objects are
//! treated as plain text noise; measured metrics ride along on `test_ended`.

use std::collections::HashMap;

use serde::Deserialize;

use super::{Completion, Token, Tokenizer};
use crate::events::{Metrics, TestIdentity};

#[derive(Debug, Deserialize)]
struct BenchRecord {
    name: Option<String>,
    status: Option<String>,
    error: Option<String>,
    count: Option<usize>,
    done: Option<bool>,
    #[serde(default)]
    metrics: HashMap<String, String>,
}

/// Tokenizer for JSON-per-line benchmark output.
#[derive(Default)]
pub struct BenchmarkTokenizer;

impl BenchmarkTokenizer {
    /// Create a new tokenizer.
    pub fn new() -> Self {
        Self
    }

    fn identity(name: &str) -> TestIdentity {
        match name.split_once('#') {
            Some((scope, case)) => TestIdentity::new(scope, case),
            None => TestIdentity::new("benchmark", name),
        }
    }
}

impl Tokenizer for BenchmarkTokenizer {
    fn tokenize(&mut self, line: &str) -> Token {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Token::Text;
        }

        let record: BenchRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(_) => return Token::Text,
        };

        if let Some(name) = record.name {
            let test = Self::identity(&name);
            let metrics: Metrics = record
                .metrics
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect();
            let completion = match record.status.as_deref() {
                Some("ok") | Some("passed") | None => Completion::Pass,
                Some("skipped") => Completion::Skip,
                _ => Completion::Fail,
            };
            let trace = record.error.unwrap_or_default();
            return Token::TestComplete(test, completion, metrics, trace);
        }

        if let Some(count) = record.count {
            return Token::Header(count);
        }

        if record.done == Some(true) {
            return Token::Summary(None);
        }

        Token::Text
    }

    fn name(&self) -> &'static str {
        "benchmark"
    }
}
