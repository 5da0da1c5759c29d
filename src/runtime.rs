//! The cross-thread handoff for delegated tasks.
//!
//! This is the single concurrency hazard in the crate, so it is modelled as
//! an explicit message-passing boundary: the connection submits a job to a
//! [`TaskRunner`], the worker runs the engine's delegated tasks, and then
//! posts a [`TaskCompletion`] back through a [`ScriptScheduler`]. Only the
//! script thread, on receiving that token, re-enters the encode loop via
//! [`TlsConnection::resume_tasks`](crate::TlsConnection::resume_tasks).

use crate::engine::DelegatedTask;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque caller context carried with a task-completion continuation, so the
/// embedding runtime can restore error-handling scope (e.g. a Node.js-style
/// domain) before resuming.
pub type Domain = Arc<dyn Any + Send + Sync>;

/// A bounded worker pool for CPU-bound handshake work.
///
/// Fire-and-forget: no ordering guarantee relative to other submissions.
pub trait TaskRunner: Send + Sync {
    fn submit(&self, task: DelegatedTask);
}

/// Posts continuations back onto the single script thread.
///
/// Implementations must run deliveries in submission order per context, and
/// must hand each token to
/// [`TlsConnection::resume_tasks`](crate::TlsConnection::resume_tasks) on the
/// script thread before processing later caller operations.
pub trait ScriptScheduler: Send + Sync {
    fn enqueue(&self, done: TaskCompletion, domain: Option<Domain>);
}

/// Proof that one delegated-task batch finished.
///
/// Not `Clone` and not constructible outside this crate, so each batch can
/// resume the encode loop at most once.
#[derive(Debug)]
pub struct TaskCompletion {
    _private: (),
}

impl TaskCompletion {
    pub(crate) fn new() -> Self {
        TaskCompletion { _private: () }
    }
}

/// A [`TaskRunner`] backed by tokio's blocking-task pool.
#[derive(Clone)]
pub struct SpawnBlockingPool {
    handle: tokio::runtime::Handle,
}

impl SpawnBlockingPool {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        SpawnBlockingPool { handle }
    }

    /// Uses the runtime of the calling context.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        SpawnBlockingPool {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskRunner for SpawnBlockingPool {
    fn submit(&self, task: DelegatedTask) {
        self.handle.spawn_blocking(task);
    }
}

/// A [`ScriptScheduler`] that forwards completions over an unbounded channel.
///
/// The embedder drains the receiving half on its script thread and hands each
/// token to the owning connection. An unbounded sender keeps `enqueue`
/// non-blocking from worker threads; completions are rare (one per handshake
/// task batch) so the queue stays tiny.
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<(TaskCompletion, Option<Domain>)>,
}

impl ChannelScheduler {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(TaskCompletion, Option<Domain>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelScheduler { tx }, rx)
    }
}

impl ScriptScheduler for ChannelScheduler {
    fn enqueue(&self, done: TaskCompletion, domain: Option<Domain>) {
        // If the script thread is gone the completion has nowhere to go.
        let _ = self.tx.send((done, domain));
    }
}
