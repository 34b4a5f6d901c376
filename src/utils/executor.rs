//! Command execution abstraction for testability
//!
//! Every locator/snapshotter invocation goes through the [`CommandExecutor`]
//! trait so tests can substitute canned outputs. Unlike a convenience
//! wrapper, a non-zero exit code is NOT an error here: callers classify exit
//! codes themselves. `Err` strictly means the process could not be run.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use tracing::debug;

/// Captured result of one subprocess run
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout + stderr, for raw-output preservation
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Abstraction for command execution, enabling mocking in tests
pub trait CommandExecutor: Send + Sync {
    /// Run a program to completion with the given arguments and extra
    /// environment variables, capturing both output streams.
    fn execute(
        &self,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<CommandOutput>;
}

/// Default implementation using real subprocess calls
#[derive(Debug, Clone, Default)]
pub struct RealExecutor;

impl RealExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<CommandOutput> {
        debug!("Running command: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute {}", program))?;

        Ok(CommandOutput {
            // A signal-terminated process has no code; treat it as -1
            exit_code: output.status.code().unwrap_or(-1),
            stdout: decode_console_bytes(&output.stdout),
            stderr: decode_console_bytes(&output.stderr),
        })
    }
}

/// Decode subprocess output that may be in a platform-default codepage
/// rather than UTF-8. Invalid sequences are replaced, never propagated as
/// errors, so already-read output stays usable.
pub fn decode_console_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// A mock executor for testing that records calls and returns configured
/// responses, keyed by program name.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Recorded command invocation
    #[derive(Clone, Debug)]
    pub struct CommandCall {
        pub program: String,
        pub args: Vec<String>,
        pub env: HashMap<String, String>,
    }

    /// Response configuration for mock
    #[derive(Clone, Debug)]
    pub enum MockResponse {
        /// Process ran; caller sees this exact output
        Output {
            exit_code: i32,
            stdout: String,
            stderr: String,
        },
        /// Process could not be started at all
        StartFailure(String),
    }

    impl MockResponse {
        pub fn ok(stdout: &str) -> Self {
            MockResponse::Output {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        pub fn exit(exit_code: i32, stderr: &str) -> Self {
            MockResponse::Output {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }
    }

    impl Default for MockResponse {
        fn default() -> Self {
            MockResponse::ok("")
        }
    }

    /// Mock executor for testing
    #[derive(Clone, Default)]
    pub struct MockExecutor {
        calls: Arc<Mutex<Vec<CommandCall>>>,
        responses: Arc<Mutex<HashMap<String, MockResponse>>>,
        queued: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
        default_response: Arc<Mutex<MockResponse>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Configure a response for a specific program
        pub fn expect(self, program: &str, response: MockResponse) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(program.to_string(), response);
            self
        }

        /// Queue a one-shot response for a program. Queued responses are
        /// consumed in order before the fixed per-program response applies,
        /// so a program invoked several times can answer differently per
        /// call.
        pub fn expect_next(self, program: &str, response: MockResponse) -> Self {
            self.queued
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(response);
            self
        }

        /// Set the default response for unconfigured programs
        pub fn with_default_response(self, response: MockResponse) -> Self {
            *self.default_response.lock().unwrap() = response;
            self
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<CommandCall> {
            self.calls.lock().unwrap().clone()
        }

        /// Get number of calls to a specific program
        pub fn call_count(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.program == program)
                .count()
        }
    }

    impl CommandExecutor for MockExecutor {
        fn execute(
            &self,
            program: &str,
            args: &[String],
            env: &HashMap<String, String>,
        ) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(CommandCall {
                program: program.to_string(),
                args: args.to_vec(),
                env: env.clone(),
            });

            let queued = self
                .queued
                .lock()
                .unwrap()
                .get_mut(program)
                .and_then(VecDeque::pop_front);
            let response = queued.unwrap_or_else(|| {
                self.responses
                    .lock()
                    .unwrap()
                    .get(program)
                    .cloned()
                    .unwrap_or_else(|| self.default_response.lock().unwrap().clone())
            });

            match response {
                MockResponse::Output {
                    exit_code,
                    stdout,
                    stderr,
                } => Ok(CommandOutput {
                    exit_code,
                    stdout,
                    stderr,
                }),
                MockResponse::StartFailure(message) => Err(anyhow::anyhow!(message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn test_mock_executor_records_calls() {
        let executor = MockExecutor::new();
        let _ = executor.execute(
            "restic",
            &["backup".to_string(), "--tag".to_string()],
            &HashMap::new(),
        );

        assert_eq!(executor.call_count("restic"), 1);
        let calls = executor.get_calls();
        assert_eq!(calls[0].program, "restic");
        assert_eq!(calls[0].args, vec!["backup", "--tag"]);
    }

    #[test]
    fn test_mock_executor_configured_response() {
        let executor = MockExecutor::new().expect("restic", MockResponse::exit(3, "partial"));

        let output = executor
            .execute("restic", &[], &HashMap::new())
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stderr, "partial");
    }

    #[test]
    fn test_mock_executor_queued_responses_consumed_in_order() {
        let executor = MockExecutor::new()
            .expect("restic", MockResponse::ok("fallback"))
            .expect_next("restic", MockResponse::ok("first"))
            .expect_next("restic", MockResponse::exit(1, "second"));

        let first = executor.execute("restic", &[], &HashMap::new()).unwrap();
        assert_eq!(first.stdout, "first");
        let second = executor.execute("restic", &[], &HashMap::new()).unwrap();
        assert_eq!(second.exit_code, 1);
        // Queue drained; the fixed response takes over
        let third = executor.execute("restic", &[], &HashMap::new()).unwrap();
        assert_eq!(third.stdout, "fallback");
    }

    #[test]
    fn test_mock_executor_start_failure() {
        let executor = MockExecutor::new()
            .expect("restic", MockResponse::StartFailure("no such file".to_string()));

        let result = executor.execute("restic", &[], &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_console_bytes_replaces_invalid_utf8() {
        let decoded = decode_console_bytes(&[b'o', b'k', 0xff, b'!']);
        assert!(decoded.starts_with("ok"));
        assert!(decoded.ends_with('!'));
    }
}
