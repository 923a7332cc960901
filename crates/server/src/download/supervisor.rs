//! Cancellation tokens for running download tasks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A worker graph's claim on a task.
#[derive(Clone, Debug)]
pub struct Registration {
    pub token: CancellationToken,
    /// Distinguishes a resumed run from the one it replaced.
    pub generation: u64,
}

/// Tracks the worker graph running for each task.
#[derive(Debug, Default)]
pub struct DownloadSupervisor {
    tasks: Mutex<HashMap<Uuid, (u64, CancellationToken)>>,
    generations: Mutex<u64>,
}

impl DownloadSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run. A previous run of the same task is cancelled.
    pub fn register(&self, task_id: Uuid) -> Registration {
        let generation = {
            let mut next = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let token = CancellationToken::new();
        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, (generation, token.clone()));
        if let Some((_, old)) = previous {
            old.cancel();
        }
        Registration { token, generation }
    }

    /// Trip the token of a running task. Returns whether one was running.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(&task_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a finished run, unless a newer run already replaced it.
    pub fn deregister(&self, task_id: Uuid, generation: u64) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.get(&task_id).is_some_and(|(g, _)| *g == generation) {
            tasks.remove(&task_id);
        }
    }

    pub fn is_registered(&self, task_id: Uuid) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&task_id)
    }

    /// Cancel every running task. Used on shutdown.
    pub fn cancel_all(&self) {
        for (_, token) in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_resumed_run_replaces_the_old_one() {
        let supervisor = DownloadSupervisor::new();
        let id = Uuid::new_v4();
        let first = supervisor.register(id);
        let second = supervisor.register(id);
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());

        // The stale run finishing must not drop the new registration.
        supervisor.deregister(id, first.generation);
        assert!(supervisor.is_registered(id));

        assert!(supervisor.cancel(id));
        assert!(second.token.is_cancelled());
        supervisor.deregister(id, second.generation);
        assert!(!supervisor.is_registered(id));
        assert!(!supervisor.cancel(id));
    }
}
