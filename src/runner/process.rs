//! Local-process runner implementation.
//!
//! Runs the configured test command as a local child process and streams its
//! merged stdout/stderr through a result parser. Useful for development and
//! for targets reachable through a wrapper script (adb shell, ssh, etc.).

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use super::{RemoteRunner, RerunFilter, RunnerError, RunnerResult};
use crate::config::ProcessRunnerConfig;
use crate::events::{ExpectedTestSet, TestEventSink, TestIdentity};
use crate::parser::ResultParser;

/// How many trailing output lines to keep as a diagnostic fallback.
const TAIL_LINES: usize = 10;

/// A runner that executes the test command as a local child process.
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    run_name: String,
}

impl ProcessRunner {
    /// Create a runner for one channel.
    pub fn new(run_name: impl Into<String>, config: ProcessRunnerConfig) -> Self {
        Self {
            config,
            run_name: run_name.into(),
        }
    }

    fn base_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.command);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl RemoteRunner for ProcessRunner {
    async fn collect(&mut self) -> RunnerResult<ExpectedTestSet> {
        let mut cmd = self.base_command();
        cmd.args(&self.config.collect_args);

        let output = cmd
            .output()
            .await
            .map_err(|e| RunnerError::CollectFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(RunnerError::CollectFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let tests = stdout.lines().filter_map(|line| {
            let trimmed = line.trim();
            let (scope, name) = trimmed.split_once('#')?;
            if scope.is_empty() || name.is_empty() || name.contains(' ') {
                return None;
            }
            Some(TestIdentity::new(scope, name))
        });

        let expected = ExpectedTestSet::new(tests);
        debug!(runner = self.name(), count = expected.len(), "collected expected test set");
        Ok(expected)
    }

    async fn run(
        &mut self,
        filter: Option<&RerunFilter>,
        sink: &mut dyn TestEventSink,
    ) -> RunnerResult<()> {
        // The filter artifact must exist before the invocation and is
        // removed (on drop) after it.
        let artifact = filter.map(|f| f.materialize()).transpose()?;

        let mut cmd = self.base_command();
        cmd.args(&self.config.args);
        if let Some(file) = &artifact {
            cmd.arg(&self.config.filter_flag).arg(file.path());
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::LaunchFailed(e.to_string()))?;

        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        let mut merged = stream::select(
            LinesStream::new(BufReader::new(stdout).lines()),
            LinesStream::new(BufReader::new(stderr).lines()),
        );

        let mut parser = ResultParser::new(
            &self.run_name,
            self.config.format.tokenizer(),
            sink,
        );
        let mut tail: VecDeque<String> = VecDeque::new();

        let runner = self.name();
        let drain = async {
            while let Some(line) = merged.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(runner, error = %e, "failed to read output line");
                        String::new()
                    }
                };
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
                parser.process_line(&line);
            }
        };

        match self.config.timeout_secs {
            Some(secs) => {
                if tokio::time::timeout(Duration::from_secs(secs), drain)
                    .await
                    .is_err()
                {
                    warn!(runner = self.name(), "test command timed out after {}s, killing", secs);
                    child.kill().await.ok();
                }
            }
            None => drain.await,
        }

        let status = child.wait().await?;
        debug!(runner = self.name(), code = status.code(), "test command exited");

        if !tail.is_empty() {
            parser.set_fallback_log(tail.iter().cloned().collect::<Vec<_>>().join("\n"));
        }
        parser.flush();

        drop(artifact);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;
    use crate::parser::OutputFormat;

    fn shell_config(script: &str) -> ProcessRunnerConfig {
        ProcessRunnerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            collect_args: Vec::new(),
            filter_flag: "--test-filter-file".to_string(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: Some(30),
            format: OutputFormat::Gtest,
        }
    }

    #[tokio::test]
    async fn test_collect_parses_one_identity_per_line() {
        let mut config = shell_config("");
        config.collect_args = vec![
            "-c".to_string(),
            "printf 'FooTest#Bar\\nFooTest#Baz\\nsome noise\\n'".to_string(),
        ];
        let mut runner = ProcessRunner::new("shard-0", config);

        let expected = runner.collect().await.unwrap();
        assert_eq!(expected.len(), 2);
        assert!(expected.contains(&TestIdentity::new("FooTest", "Bar")));
        assert!(expected.contains(&TestIdentity::new("FooTest", "Baz")));
    }

    #[tokio::test]
    async fn test_run_streams_output_through_parser() {
        let script = "printf '[==========] Running 1 test from 1 test suite.\\n\
[ RUN      ] FooTest.Bar\\n\
[       OK ] FooTest.Bar (0 ms)\\n\
[==========] 1 test from 1 test suite ran. (0 ms total)\\n'";
        let mut runner = ProcessRunner::new("shard-0", shell_config(script));

        let mut sink = CollectingSink::new();
        runner.run(None, &mut sink).await.unwrap();

        assert_eq!(sink.expected_count, Some(1));
        assert_eq!(sink.completed().len(), 1);
        assert!(!sink.has_run_failure());
        assert!(sink.run_ended);
    }

    #[tokio::test]
    async fn test_unparseable_output_reports_run_failure() {
        let mut runner =
            ProcessRunner::new("shard-0", shell_config("echo 'nothing test shaped here'"));

        let mut sink = CollectingSink::new();
        runner.run(None, &mut sink).await.unwrap();

        assert!(sink.has_run_failure());
        assert!(sink.run_failures[0].contains("nothing test shaped here"));
        assert!(sink.run_ended);
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_fatal() {
        let mut config = shell_config("");
        config.command = "/nonexistent/retread-test-binary".to_string();
        let mut runner = ProcessRunner::new("shard-0", config);

        let mut sink = CollectingSink::new();
        let err = runner.run(None, &mut sink).await.unwrap_err();
        assert!(matches!(err, RunnerError::LaunchFailed(_)));
        assert!(sink.events.is_empty());
    }
}
