//! Cancellation handles for spawned operations
//!
//! Every asynchronous operation of this crate can be run as a plain `async fn`
//! or spawned onto the tokio runtime with a completion callback. The spawned
//! form returns an [`OperationHandle`]. Dropping the handle aborts the
//! operation, so whatever owns the handle (a peer, a device record, a pending
//! command) cannot be torn down while the operation still runs against it.
//!
//! The callback is invoked exactly once when the operation completes, and
//! never if the operation was cancelled first.
//!
//! # Example
//!
//! ```rust,no_run
//! use natter_traversal::task::OperationHandle;
//!
//! # async fn example() {
//! let handle = OperationHandle::spawn(async { 40 + 2 }, |answer| {
//!     println!("answer: {answer}");
//! });
//! handle.wait().await.unwrap();
//! # }
//! ```

use std::future::Future;
use tokio::task::{JoinError, JoinHandle};

/// Owner of a spawned operation; aborts it on drop
#[derive(Debug)]
#[must_use = "dropping an OperationHandle cancels the operation"]
pub struct OperationHandle {
    task: JoinHandle<()>,
}

impl OperationHandle {
    /// Spawn `operation` and hand its output to `on_result` once it completes
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, C>(operation: F, on_result: C) -> Self
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        C: FnOnce(F::Output) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let output = operation.await;
            on_result(output);
        });
        Self { task }
    }

    /// Cancel the operation. The callback will not run if it has not already.
    pub fn cancel(self) {
        drop(self);
    }

    /// Whether the operation (and its callback) has finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the operation and its callback to complete
    ///
    /// # Errors
    ///
    /// Returns the join error if the operation or callback panicked.
    pub async fn wait(mut self) -> Result<(), JoinError> {
        (&mut self.task).await
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_callback_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = OperationHandle::spawn(async { 7 }, move |value| {
            assert_eq!(value, 7);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = OperationHandle::spawn(
            tokio::time::sleep(Duration::from_millis(200)),
            move |()| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(!handle.is_finished());
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
