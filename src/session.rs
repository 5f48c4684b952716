use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::source::SourceUnit;
use crate::value::Value;
use crate::verdict::Verdict;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Queued,
    Compiling,
    Running,
    Completed,
    Rejected,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Rejected | SessionState::Cancelled
        )
    }
}

/// What a client hands to the engine
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub units: Vec<SourceUnit>,
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Lifecycle of one submission
///
/// The state lives in a watch channel so waiters are woken on every
/// transition. The verdict is written once, before the terminal state is
/// published.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    units: Vec<SourceUnit>,
    arguments: Vec<Value>,
    deadline: Duration,
    created_at: String,
    state: watch::Sender<SessionState>,
    verdict: OnceLock<Verdict>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: SessionId, submission: Submission, default_deadline: Duration) -> Self {
        let deadline = submission
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(default_deadline);
        Self {
            id,
            units: submission.units,
            arguments: submission.arguments,
            deadline,
            created_at: crate::create_timestamp(),
            state: watch::Sender::new(SessionState::Queued),
            verdict: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn units(&self) -> &[SourceUnit] {
        &self.units
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Time allowed from the start of compilation to the end of execution
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.get()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Moves to `next` unless the session already ended
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Stores the verdict, or hands it back if one was already recorded
    pub(crate) fn record(&self, verdict: Verdict) -> Result<(), Verdict> {
        self.verdict.set(verdict)
    }

    /// Resolves once the session reached a terminal state
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // the sender lives in `self`, so it cannot be gone
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let submission = Submission {
            units: vec![SourceUnit::entry("Main", "fn main() { }")],
            deadline_ms: None,
            arguments: Vec::new(),
        };
        Session::new(SessionId(1), submission, Duration::from_millis(250))
    }

    #[test]
    fn test_state_transitions_stop_at_terminal() {
        let session = session();
        assert_eq!(session.state(), SessionState::Queued);
        assert!(session.advance(SessionState::Compiling));
        assert!(!session.advance(SessionState::Compiling));
        assert!(session.advance(SessionState::Cancelled));
        assert!(!session.advance(SessionState::Running));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_verdict_is_set_once() {
        let session = session();
        assert_eq!(session.record(Verdict::Cancelled), Ok(()));
        let rejected = session
            .record(Verdict::Rejected {
                reason: "late".into(),
            })
            .unwrap_err();
        assert!(matches!(rejected, Verdict::Rejected { .. }));
        assert_eq!(session.verdict(), Some(&Verdict::Cancelled));
    }

    #[test]
    fn test_deadline_defaults() {
        assert_eq!(session().deadline(), Duration::from_millis(250));
        let submission: Submission = serde_json::from_str(
            r#"{"units":[{"name":"Main","text":"","entryPoint":true}],"deadlineMs":10}"#,
        )
        .unwrap();
        assert!(submission.arguments.is_empty());
        let session = Session::new(SessionId(2), submission, Duration::from_secs(5));
        assert_eq!(session.deadline(), Duration::from_millis(10));
        assert!(session.units()[0].entry_point);
    }

    #[tokio::test]
    async fn test_finished_wakes_on_terminal_state() {
        let session = std::sync::Arc::new(session());
        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.finished().await }
        });
        session.advance(SessionState::Running);
        session.advance(SessionState::Completed);
        assert_eq!(waiter.await.unwrap(), SessionState::Completed);
    }
}
