mod join_handle;
pub(crate) mod stream;

use std::future::Future;

pub(crate) use join_handle::AsyncJoinHandle;

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}
