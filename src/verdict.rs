use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::{CompileError, Diagnostic};
use crate::sandbox::{Captured, SandboxOutcome};
use crate::session::{Session, SessionState};
use crate::value::Value;

/// Final, immutable outcome of a session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Verdict {
    Success {
        value: Value,
        stdout: String,
        stderr: String,
        elapsed_ms: u64,
    },
    CompileFailure {
        diagnostics: Vec<Diagnostic>,
    },
    RuntimeFault {
        exception: String,
        stdout: String,
        stderr: String,
        elapsed_ms: u64,
    },
    Timeout {
        stdout: String,
        stderr: String,
    },
    Rejected {
        reason: String,
    },
    Cancelled,
}

impl Verdict {
    /// The state a session ends in with this verdict
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Verdict::Rejected { .. } => SessionState::Rejected,
            Verdict::Cancelled => SessionState::Cancelled,
            _ => SessionState::Completed,
        }
    }
}

/// Everything that can end a session, before it is turned into a verdict
#[derive(Debug)]
pub enum Outcome {
    Compiled(CompileError),
    /// The deadline passed while compiling
    CompileTimedOut,
    Executed(SandboxOutcome),
    Rejected(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ResultCollector {
    max_output_bytes: usize,
}

impl ResultCollector {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    /// Records the verdict of `session` and moves it to its terminal state
    ///
    /// Calling this again for the same session leaves the first verdict in
    /// place and returns it.
    pub fn finalize(&self, session: &Session, outcome: Outcome) -> Verdict {
        if let Some(existing) = session.verdict() {
            log::error!(
                "Session {} already has a verdict, dropping outcome {outcome:?}",
                session.id()
            );
            return existing.clone();
        }

        let verdict = self.verdict_for(outcome);
        if let Err(rejected) = session.record(verdict.clone()) {
            log::error!(
                "Session {} was completed twice, dropping verdict {rejected:?}",
                session.id()
            );
        }
        let Some(recorded) = session.verdict() else {
            log::error!("Session {} has no verdict after recording one", session.id());
            return verdict;
        };
        session.advance(recorded.terminal_state());
        log::info!(
            "Session {} finished: {}",
            session.id(),
            describe(recorded)
        );
        recorded.clone()
    }

    fn verdict_for(&self, outcome: Outcome) -> Verdict {
        match outcome {
            Outcome::Compiled(CompileError::Failure(diagnostics)) => {
                Verdict::CompileFailure { diagnostics }
            }
            Outcome::Compiled(e) => Verdict::Rejected {
                reason: e.to_string(),
            },
            Outcome::CompileTimedOut => Verdict::Timeout {
                stdout: String::new(),
                stderr: String::new(),
            },
            Outcome::Executed(SandboxOutcome::Success {
                value,
                stdout,
                stderr,
                elapsed,
            }) => Verdict::Success {
                value,
                stdout: self.render(stdout),
                stderr: self.render(stderr),
                elapsed_ms: millis(elapsed),
            },
            Outcome::Executed(SandboxOutcome::Fault {
                fault,
                stdout,
                stderr,
                elapsed,
            }) => Verdict::RuntimeFault {
                exception: fault.to_string(),
                stdout: self.render(stdout),
                stderr: self.render(stderr),
                elapsed_ms: millis(elapsed),
            },
            Outcome::Executed(SandboxOutcome::Timeout { stdout, stderr }) => Verdict::Timeout {
                stdout: self.render(stdout),
                stderr: self.render(stderr),
            },
            Outcome::Executed(SandboxOutcome::Interrupted { .. }) | Outcome::Cancelled => {
                Verdict::Cancelled
            }
            Outcome::Rejected(reason) => Verdict::Rejected { reason },
        }
    }

    /// Cuts captured output to the limit and marks how much was lost
    fn render(&self, captured: Captured) -> String {
        let Captured {
            mut text,
            mut dropped,
        } = captured;
        if text.len() > self.max_output_bytes {
            let mut cut = self.max_output_bytes;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            dropped += text.len() - cut;
            text.truncate(cut);
        }
        if dropped > 0 {
            text.push_str(&format!("...[truncated {dropped} bytes]"));
        }
        text
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn describe(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Success { .. } => "success",
        Verdict::CompileFailure { .. } => "compile failure",
        Verdict::RuntimeFault { .. } => "runtime fault",
        Verdict::Timeout { .. } => "timeout",
        Verdict::Rejected { .. } => "rejected",
        Verdict::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Fault, FaultKind};
    use crate::session::{SessionId, Submission};
    use crate::source::{SourceError, SourceUnit};
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn session() -> Session {
        let submission = Submission {
            units: vec![SourceUnit::entry("Main", "fn main() { }")],
            ..Default::default()
        };
        Session::new(SessionId(9), submission, Duration::from_secs(1))
    }

    fn captured(text: &str, dropped: usize) -> Captured {
        Captured {
            text: text.to_string(),
            dropped,
        }
    }

    #[test]
    fn test_success_verdict_json() {
        let collector = ResultCollector::new(1024);
        let session = session();
        let verdict = collector.finalize(
            &session,
            Outcome::Executed(SandboxOutcome::Success {
                value: Value::Int(42),
                stdout: captured("hi\n", 0),
                stderr: captured("", 0),
                elapsed: Duration::from_millis(12),
            }),
        );
        assert_eq!(session.state(), SessionState::Completed);
        assert_json_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({
                "kind": "success",
                "value": 42,
                "stdout": "hi\n",
                "stderr": "",
                "elapsedMs": 12
            })
        );
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let collector = ResultCollector::new(1024);
        let session = session();
        let first = collector.finalize(&session, Outcome::Cancelled);
        let second = collector.finalize(&session, Outcome::Rejected("late".into()));
        assert_eq!(first, Verdict::Cancelled);
        assert_eq!(second, Verdict::Cancelled);
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_output_is_truncated_with_marker() {
        let collector = ResultCollector::new(4);
        let verdict = collector.finalize(
            &session(),
            Outcome::Executed(SandboxOutcome::Timeout {
                stdout: captured("abcdef", 10),
                stderr: captured("ok", 0),
            }),
        );
        assert_eq!(
            verdict,
            Verdict::Timeout {
                stdout: "abcd...[truncated 12 bytes]".into(),
                stderr: "ok".into(),
            }
        );
    }

    #[test]
    fn test_compile_errors_map_to_verdicts() {
        let collector = ResultCollector::new(16);
        let session = session();
        let verdict = collector.finalize(
            &session,
            Outcome::Compiled(CompileError::Unavailable("out of slots".into())),
        );
        assert_eq!(
            verdict,
            Verdict::Rejected {
                reason: "compiler unavailable: out of slots".into()
            }
        );
        assert_eq!(session.state(), SessionState::Rejected);

        let verdict = collector.finalize(
            &self::session(),
            Outcome::Compiled(CompileError::Invalid(SourceError::NoEntryPoint)),
        );
        assert!(matches!(verdict, Verdict::Rejected { .. }));

        let diagnostic = Diagnostic::error("Main", 1, 2, "boom");
        let verdict = collector.finalize(
            &self::session(),
            Outcome::Compiled(CompileError::Failure(vec![diagnostic.clone()])),
        );
        assert_json_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({
                "kind": "compileFailure",
                "diagnostics": [
                    {"unit": "Main", "line": 1, "column": 2, "severity": "error", "message": "boom"}
                ]
            })
        );
    }

    #[test]
    fn test_fault_and_timeout_verdicts() {
        let collector = ResultCollector::new(16);
        let verdict = collector.finalize(
            &session(),
            Outcome::Executed(SandboxOutcome::Fault {
                fault: Fault::new(FaultKind::Exception, "bad"),
                stdout: captured("", 0),
                stderr: captured("", 0),
                elapsed: Duration::from_millis(3),
            }),
        );
        assert_eq!(
            serde_json::to_value(&verdict).unwrap()["exception"],
            json!("Exception: bad")
        );

        let verdict = collector.finalize(&session(), Outcome::CompileTimedOut);
        assert_json_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({"kind": "timeout", "stdout": "", "stderr": ""})
        );
        assert_json_eq!(
            serde_json::to_value(Verdict::Cancelled).unwrap(),
            json!({"kind": "cancelled"})
        );
    }
}
