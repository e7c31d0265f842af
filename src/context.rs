//! The execution-context abstraction that user-visible callbacks run on.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;

use crate::runtime;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type Task = Box<dyn FnOnce() + Send>;

/// A serial task executor with stable identity.
///
/// Every pooled connection is permanently bound to the context it was created on, and the ready
/// handler of an acquire always runs on the caller's context. Tasks submitted to one context run
/// strictly in submission order, one at a time.
///
/// Cloning a `Context` yields another handle to the same executor; two handles compare equal iff
/// they refer to the same executor. The backing task exits once every handle has been dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    sender: mpsc::UnboundedSender<Task>,
}

impl Context {
    /// Creates a new context backed by a task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        runtime::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task();
            }
        });
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                sender,
            }),
        }
    }

    /// Submits a unit of work to run on this context.
    ///
    /// The task is silently dropped if the executor has already shut down, which can only happen
    /// once every handle to this context is gone.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.inner.sender.send(Box::new(task));
    }

    /// The process-unique identity of this context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("id", &self.inner.id).finish()
    }
}
