use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Owner of background tasks.
///
/// Every task gets a token derived from the root; `shutdown_all` cancels the
/// root, waits for tasks to wind down, and aborts whatever is left.
pub struct TaskSupervisor {
    root: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A token cancelled when the supervisor shuts down
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        // Reap finished tasks so the set does not grow with every run
        while let Some(finished) = tasks.try_join_next() {
            log_exit(finished);
        }
        debug!(task = name, "spawning supervised task");
        tasks.spawn(task)
    }

    /// Tasks not yet reaped
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Cancel every task and wait up to `timeout` for them to finish.
    /// Returns how many had to be aborted.
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        self.root.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks());

        let drained = tokio::time::timeout(timeout, async {
            while let Some(finished) = tasks.join_next().await {
                log_exit(finished);
            }
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let stuck = tasks.len();
        warn!(stuck, "background tasks did not stop within {:?}, aborting", timeout);
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        stuck
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn log_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("supervised task panicked: {}", e);
        }
    }
}
