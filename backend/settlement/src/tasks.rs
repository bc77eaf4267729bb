//! Registry of per-project background tasks.
//!
//! Each `(project, kind)` pair owns at most one [`CancellationToken`]. Tasks
//! select on their token alongside every sleep, so `stop` ends them at the
//! next suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::ProjectIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Waits for the recipient to unlock a fully raised project, then funds the escrow.
    UnlockWait,
    PaybackMonitor,
    PaymentReminder,
}

/// A registration handed to a running task; it clears only its own entry.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    id: u64,
    token: CancellationToken,
}

impl TaskTicket {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tokens: Mutex<HashMap<(ProjectIndex, TaskKind), TaskTicket>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Returns `None` when one of that kind is already running.
    pub fn register(&self, project: ProjectIndex, kind: TaskKind) -> Option<TaskTicket> {
        let mut tokens = self.lock();
        if tokens.contains_key(&(project, kind)) {
            return None;
        }
        let ticket = TaskTicket {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        tokens.insert((project, kind), ticket.clone());
        Some(ticket)
    }

    /// Called by a task on exit so it can be started again later. A task
    /// stopped and replaced in the meantime leaves its successor registered.
    pub fn finished(&self, project: ProjectIndex, kind: TaskKind, ticket: &TaskTicket) {
        let mut tokens = self.lock();
        if tokens.get(&(project, kind)).is_some_and(|t| t.id == ticket.id) {
            tokens.remove(&(project, kind));
        }
    }

    pub fn is_running(&self, project: ProjectIndex, kind: TaskKind) -> bool {
        self.lock().contains_key(&(project, kind))
    }

    /// Cancel every task belonging to `project`.
    pub fn stop(&self, project: ProjectIndex) {
        let mut tokens = self.lock();
        tokens.retain(|(p, kind), ticket| {
            if *p == project {
                info!("Stopping {kind:?} task for project {project}");
                ticket.token.cancel();
                false
            } else {
                true
            }
        });
    }

    pub fn stop_all(&self) {
        for (_, ticket) in self.lock().drain() {
            ticket.token.cancel();
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(ProjectIndex, TaskKind), TaskTicket>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}
