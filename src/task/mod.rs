//! Future vocabulary shared by the loading pipeline.
//!
//! Long-running module operations (state constructors, dynamic symbol
//! constructors, start events, commits) are all plain boxed futures polled
//! by the caller's executor. Cancellation is expressed by dropping the
//! future before completion.

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::core::{Result, RuntimeError};

/// A pinned, heap-allocated future. Pinning at construction keeps
/// self-referential state valid between the first poll and completion.
pub type DynFuture<T> = BoxFuture<'static, T>;

/// Write-once cell with wake-on-set semantics.
///
/// Producers publish a single value; any number of consumers can wait for
/// it. Waiting after the producer is gone without a value resolves to
/// `Cancelled`.
#[derive(Debug)]
pub struct StatusCell<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> StatusCell<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Publishes the value. The first publication wins; later calls are
    /// ignored so a settled cell never changes its answer.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value.clone());
            true
        });
    }

    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> StatusWaiter<T> {
        StatusWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> Default for StatusCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a [`StatusCell`].
#[derive(Debug)]
pub struct StatusWaiter<T: Clone> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> StatusWaiter<T> {
    /// Resolves once the producer publishes a value.
    pub async fn wait(mut self, what: &str) -> Result<T> {
        loop {
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Ok(value);
            }
            self.rx
                .changed()
                .await
                .map_err(|_| RuntimeError::Cancelled(what.to_string()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiter_sees_value_set_before_subscribe() {
        let cell = StatusCell::new();
        cell.set(3u32);
        let value = cell.subscribe().wait("cell").await.unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn first_publication_wins() {
        tokio_test::block_on(async {
            let cell = StatusCell::new();
            cell.set(1u32);
            cell.set(2u32);
            assert_eq!(cell.peek(), Some(1));
            assert_eq!(cell.subscribe().wait("cell").await.unwrap(), 1);
        });
    }

    #[tokio::test]
    async fn dropping_producer_cancels_waiters() {
        let cell: StatusCell<u32> = StatusCell::new();
        let waiter = cell.subscribe();
        drop(cell);
        let err = waiter.wait("cell").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled(_)));
    }

    #[tokio::test]
    async fn waiter_wakes_on_late_set() {
        let cell = std::sync::Arc::new(StatusCell::new());
        let waiter = cell.subscribe();
        let publisher = cell.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.set(9u32);
        });
        assert_eq!(waiter.wait("cell").await.unwrap(), 9);
        handle.await.unwrap();
    }
}
