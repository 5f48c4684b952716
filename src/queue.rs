use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::session::{Session, SessionId};

/// Counters exposed by the scheduler
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub queued: usize,
    pub active: usize,
    pub peak_active: usize,
    pub compilations: u64,
    /// Execution threads started by the sandbox
    pub executions: u64,
    pub completed: u64,
}

#[derive(Default)]
struct Slots {
    pending: VecDeque<Arc<Session>>,
    stats: SchedulerStats,
}

/// FIFO of sessions waiting for a slot, plus the slot accounting
///
/// Workers take sessions with [`SessionQueue::pop`], which also claims the
/// slot; [`SessionQueue::release`] hands it back.
pub struct SessionQueue {
    slots: Mutex<Slots>,
    notify: Notify,
    capacity: Option<usize>,
}

impl SessionQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues `session`, handing it back when the queue is full
    pub fn push(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        {
            let mut slots = self.slots.lock();
            if self
                .capacity
                .is_some_and(|capacity| slots.pending.len() >= capacity)
            {
                return Err(session);
            }
            log::debug!("Session {} queued at position {}", session.id(), slots.pending.len());
            slots.pending.push_back(session);
            slots.stats.queued = slots.pending.len();
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> Arc<Session> {
        loop {
            if let Some(session) = self.try_pop() {
                return session;
            }
            self.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<Arc<Session>> {
        let mut slots = self.slots.lock();
        let session = slots.pending.pop_front()?;
        let stats = &mut slots.stats;
        stats.queued -= 1;
        stats.active += 1;
        stats.peak_active = stats.peak_active.max(stats.active);
        Some(session)
    }

    /// Takes a session out of the queue before any worker saw it
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut slots = self.slots.lock();
        let position = slots.pending.iter().position(|s| s.id() == id)?;
        let session = slots.pending.remove(position);
        slots.stats.queued = slots.pending.len();
        session
    }

    /// Everything still waiting, oldest first
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut slots = self.slots.lock();
        slots.stats.queued = 0;
        slots.pending.drain(..).collect()
    }

    pub fn release(&self) {
        let mut slots = self.slots.lock();
        slots.stats.active = slots.stats.active.saturating_sub(1);
    }

    pub fn record_compilation(&self) {
        self.slots.lock().stats.compilations += 1;
    }

    pub fn record_completion(&self) {
        self.slots.lock().stats.completed += 1;
    }

    pub fn stats(&self) -> SchedulerStats {
        self.slots.lock().stats
    }
}
