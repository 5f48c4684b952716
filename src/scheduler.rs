//! Admission, bookkeeping and lookup of sessions.
//!
//! The [`Scheduler`] owns the queue and the session registry. Workers (see
//! [`crate::worker`]) take sessions from the queue, one per slot, and hand the
//! outcome back through [`Scheduler::finish`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::compiler::{Compiler, CompilerLimits};
use crate::config::EngineConfig;
use crate::mash::Masher;
use crate::queue::{SchedulerStats, SessionQueue};
use crate::sandbox::{Sandbox, SandboxLimits};
use crate::session::{Session, SessionId, SessionState, Submission};
use crate::source::validate_units;
use crate::verdict::{Outcome, ResultCollector, Verdict};
use crate::worker::worker;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} ended without a verdict")]
    MissingVerdict(SessionId),
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Terminal sessions, oldest first
    retired: VecDeque<SessionId>,
}

pub struct Scheduler {
    config: EngineConfig,
    queue: SessionQueue,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    pub(crate) compiler: Arc<Compiler>,
    pub(crate) sandbox: Sandbox,
    collector: ResultCollector,
    masher: Masher,
}

impl Scheduler {
    pub fn new(config: EngineConfig) -> Self {
        let compiler = Compiler::new(CompilerLimits {
            max_source_bytes: config.max_source_bytes.as_usize(),
            ..CompilerLimits::default()
        });
        let compiler = Arc::new(compiler);
        Self {
            queue: SessionQueue::new(config.queue_capacity),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            masher: Masher::new(compiler.clone(), config.slots),
            compiler,
            sandbox: Sandbox::new(SandboxLimits::from(&config)),
            collector: ResultCollector::new(config.max_output_bytes.as_usize()),
            config,
        }
    }

    /// Builds a scheduler and spawns one worker per slot
    ///
    /// Workers stop after their current session once `token` is cancelled.
    pub fn start(
        config: EngineConfig,
        token: CancellationToken,
    ) -> (Arc<Self>, JoinSet<anyhow::Result<()>>) {
        let slots = config.slots.max(1);
        let scheduler = Arc::new(Self::new(config));
        let mut workers = JoinSet::new();
        for slot in 1..=slots {
            workers.spawn(worker(slot, scheduler.clone(), token.clone()));
        }
        log::info!("Scheduler started with {slots} slot(s)");
        (scheduler, workers)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Coalescing shares the compiler and is bounded by the slot count
    pub fn masher(&self) -> &Masher {
        &self.masher
    }

    pub(crate) fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    /// Creates a session for `submission` and queues it; never blocks
    pub fn submit(&self, submission: Submission) -> SessionId {
        self.admit(submission).id()
    }

    /// Like [`Scheduler::submit`], but hands back the session itself, which
    /// stays readable after it is evicted from the registry
    pub fn admit(&self, submission: Submission) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let default_deadline = Duration::from(self.config.default_deadline_ms);
        let session = Arc::new(Session::new(id, submission, default_deadline));
        self.registry
            .lock()
            .sessions
            .insert(id, session.clone());

        if let Err(e) = validate_units(session.units()) {
            log::info!("Session {id} rejected at submission: {e}");
            self.finish(&session, Outcome::Rejected(e.to_string()));
            return session;
        }
        if let Err(rejected) = self.queue.push(session.clone()) {
            log::warn!("Queue is full, session {id} rejected");
            self.finish(&rejected, Outcome::Rejected("queue full".to_string()));
        }
        session
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<Session>, EngineError> {
        self.registry
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownSession(id))
    }

    pub fn poll(&self, id: SessionId) -> Result<SessionState, EngineError> {
        Ok(self.session(id)?.state())
    }

    /// Waits for the verdict of `id`
    pub async fn await_result(&self, id: SessionId) -> Result<Verdict, EngineError> {
        let session = self.session(id)?;
        await_verdict(&session).await
    }

    /// Cancels `id`; true when the session ends up cancelled by this call
    pub async fn cancel(&self, id: SessionId) -> Result<bool, EngineError> {
        let session = self.session(id)?;
        match session.state() {
            state if state.is_terminal() => return Ok(false),
            SessionState::Queued => {
                if let Some(session) = self.queue.remove(id) {
                    log::info!("Session {id} cancelled while queued");
                    let verdict = self.finish(&session, Outcome::Cancelled);
                    return Ok(verdict == Verdict::Cancelled);
                }
                // a worker took it in the meantime
            }
            _ => {}
        }

        session.cancel_token().cancel();
        let verdict = await_verdict(&session).await?;
        Ok(verdict == Verdict::Cancelled)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executions: self.sandbox.launched(),
            ..self.queue.stats()
        }
    }

    /// Records the verdict of a session and retires it
    pub(crate) fn finish(&self, session: &Session, outcome: Outcome) -> Verdict {
        // counted before the verdict becomes visible
        self.queue.record_completion();
        let verdict = self.collector.finalize(session, outcome);
        self.retire(session.id());
        verdict
    }

    fn retire(&self, id: SessionId) {
        let mut registry = self.registry.lock();
        registry.retired.push_back(id);
        while registry.retired.len() > self.config.retained_sessions {
            let Some(evicted) = registry.retired.pop_front() else {
                break;
            };
            registry.sessions.remove(&evicted);
            log::debug!("Session {evicted} evicted from the registry");
        }
    }

    /// Rejects every session still waiting; used once the workers stopped
    pub fn drain(&self) {
        for session in self.queue.drain() {
            self.finish(&session, Outcome::Rejected("engine shutting down".to_string()));
        }
    }
}

async fn await_verdict(session: &Session) -> Result<Verdict, EngineError> {
    session.finished().await;
    session.verdict().cloned().ok_or_else(|| {
        log::error!("Session {} is terminal but has no verdict", session.id());
        EngineError::MissingVerdict(session.id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceUnit;

    fn submission(text: &str) -> Submission {
        Submission {
            units: vec![SourceUnit::entry("Main", text)],
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_submission_is_rejected_immediately() {
        let scheduler = Scheduler::new(EngineConfig::default());
        let id = scheduler.submit(Submission::default());
        assert_eq!(scheduler.poll(id), Ok(SessionState::Rejected));
        let verdict = scheduler.session(id).unwrap().verdict().cloned();
        assert_eq!(
            verdict,
            Some(Verdict::Rejected {
                reason: "no source units submitted".into()
            })
        );
        assert_eq!(scheduler.stats().queued, 0);
    }

    #[test]
    fn test_full_queue_rejects() {
        let scheduler = Scheduler::new(EngineConfig {
            queue_capacity: Some(1),
            ..EngineConfig::default()
        });
        let first = scheduler.submit(submission("fn main() { }"));
        let second = scheduler.submit(submission("fn main() { }"));
        assert_eq!(scheduler.poll(first), Ok(SessionState::Queued));
        assert_eq!(scheduler.poll(second), Ok(SessionState::Rejected));
        assert_eq!(
            scheduler.session(second).unwrap().verdict(),
            Some(&Verdict::Rejected {
                reason: "queue full".into()
            })
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_session() {
        let scheduler = Scheduler::new(EngineConfig::default());
        let id = scheduler.submit(submission("fn main() { }"));
        assert_eq!(scheduler.cancel(id).await, Ok(true));
        assert_eq!(scheduler.poll(id), Ok(SessionState::Cancelled));
        assert_eq!(scheduler.cancel(id).await, Ok(false));
        assert_eq!(scheduler.stats().compilations, 0);
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_evicted_sessions() {
        let scheduler = Scheduler::new(EngineConfig {
            retained_sessions: 2,
            ..EngineConfig::default()
        });
        assert_eq!(
            scheduler.poll(SessionId(99)),
            Err(EngineError::UnknownSession(SessionId(99)))
        );
        let ids: Vec<_> = (0..3)
            .map(|_| scheduler.submit(Submission::default()))
            .collect();
        assert!(scheduler.poll(ids[0]).is_err());
        assert_eq!(scheduler.poll(ids[2]), Ok(SessionState::Rejected));
        assert!(matches!(
            scheduler.await_result(ids[1]).await,
            Ok(Verdict::Rejected { .. })
        ));
    }

    #[test]
    fn test_drain_rejects_waiting_sessions() {
        let scheduler = Scheduler::new(EngineConfig::default());
        let id = scheduler.submit(submission("fn main() { }"));
        scheduler.drain();
        assert_eq!(scheduler.poll(id), Ok(SessionState::Rejected));
    }
}
