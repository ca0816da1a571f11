//! Next-turn scheduling and completion tracking.
//!
//! Background work never touches host state directly. It hands a task to
//! the [`DeferredInvoker`], and the host loop runs that task after the
//! current host turn has unwound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::host::Host;

/// Work scheduled onto the host.
pub type Task = Box<dyn FnOnce(&mut Host) + Send + 'static>;

/// Cloneable, thread-safe handle for scheduling host tasks.
#[derive(Debug, Clone)]
pub struct DeferredInvoker {
    tx: mpsc::UnboundedSender<Task>,
}

impl DeferredInvoker {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Schedule `task` for a later host turn.
    ///
    /// Returns `false` when the host loop no longer exists; the task is
    /// dropped unrun.
    pub fn defer<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut Host) + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    done: AtomicBool,
    notify: Notify,
}

/// Observable end of one spawned operation.
#[derive(Debug, Clone)]
pub struct Completion {
    state: Arc<CompletionState>,
}

/// Marks its [`Completion`] done when dropped.
#[derive(Debug)]
pub struct CompletionGuard {
    state: Arc<CompletionState>,
}

impl Completion {
    /// Create a pending completion and the guard that finishes it.
    pub fn tracked() -> (CompletionGuard, Completion) {
        let state = Arc::new(CompletionState::default());
        (
            CompletionGuard {
                state: Arc::clone(&state),
            },
            Completion { state },
        )
    }

    /// A completion for work that finished synchronously.
    pub fn ready() -> Self {
        let (guard, completion) = Self::tracked();
        drop(guard);
        completion
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.state.done.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }
}
