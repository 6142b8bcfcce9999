//! Scripted process runner for tests.
//!
//! [`MockRunner`] never spawns anything. Responses are chosen by substring
//! rules over the full command line (ssh prefix and escaping included) and
//! every call is recorded for later assertions. Clones share state.

use crate::transport::{ProcessRunner, RunOutcome};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What a scripted call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Complete {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    TimeOut {
        stdout: String,
        stderr: String,
    },
    SpawnError,
}

impl MockResponse {
    fn outcome(&self) -> io::Result<RunOutcome> {
        match self {
            MockResponse::Complete {
                stdout,
                stderr,
                exit_code,
            } => Ok(RunOutcome::Completed {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
            }),
            MockResponse::TimeOut { stdout, stderr } => Ok(RunOutcome::TimedOut {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            MockResponse::SpawnError => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "mock: sh not found",
            )),
        }
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub line: String,
    pub timeout: Duration,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    response: MockResponse,
    once: bool,
}

#[derive(Debug)]
struct MockState {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
    fallback: MockResponse,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            calls: Vec::new(),
            fallback: MockRunner::ok(""),
        }
    }
}

/// Scripted [`ProcessRunner`].
///
/// The first rule whose pattern occurs in the line wins; `once` rules are
/// consumed when they match. Lines matching no rule get the fallback
/// response, exit 0 with empty output unless changed.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<MockState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exit 0 with `stdout`.
    pub fn ok(stdout: &str) -> MockResponse {
        Self::ok_with_stderr(stdout, "")
    }

    pub fn ok_with_stderr(stdout: &str, stderr: &str) -> MockResponse {
        MockResponse::Complete {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: 0,
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> MockResponse {
        MockResponse::Complete {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    pub fn timed_out(stdout: &str, stderr: &str) -> MockResponse {
        MockResponse::TimeOut {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Respond to every line containing `pattern`.
    pub fn on(&self, pattern: &str, response: MockResponse) {
        self.push_rule(pattern, response, false);
    }

    /// Respond to the next line containing `pattern` only.
    pub fn on_once(&self, pattern: &str, response: MockResponse) {
        self.push_rule(pattern, response, true);
    }

    /// Fail to spawn for every line containing `pattern`.
    pub fn spawn_error(&self, pattern: &str) {
        self.push_rule(pattern, MockResponse::SpawnError, false);
    }

    /// Response for lines matching no rule.
    pub fn set_fallback(&self, response: MockResponse) {
        self.state().fallback = response;
    }

    fn push_rule(&self, pattern: &str, response: MockResponse, once: bool) {
        self.state().rules.push(Rule {
            pattern: pattern.to_string(),
            response,
            once,
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Recorded lines containing `pattern`, in call order.
    pub fn lines_matching(&self, pattern: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.line.contains(pattern))
            .map(|c| c.line.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn respond(&self, line: &str, timeout: Duration) -> io::Result<RunOutcome> {
        let mut state = self.state();
        state.calls.push(RecordedCall {
            line: line.to_string(),
            timeout,
        });
        let response = match state.rules.iter().position(|r| line.contains(&r.pattern)) {
            Some(idx) if state.rules[idx].once => state.rules.remove(idx).response,
            Some(idx) => state.rules[idx].response.clone(),
            None => state.fallback.clone(),
        };
        response.outcome()
    }
}

impl ProcessRunner for MockRunner {
    async fn run(&self, command_line: &str, timeout: Duration) -> io::Result<RunOutcome> {
        self.respond(command_line, timeout)
    }
}
