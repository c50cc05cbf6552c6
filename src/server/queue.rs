//! Push/pull adapter feeding user messages into a runtime.
//!
//! Any number of pushes feed exactly one consumer. Closing the queue ends the
//! consumer's stream immediately, even if items are still buffered.

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue already has a consumer")]
    AlreadyConsumed,
}

/// FIFO queue with a single pull-based consumer.
pub struct InputQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    closed: CancellationToken,
}

impl<T: Send + 'static> InputQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Append an item, handing it straight to a waiting consumer if there is one.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        // The receiver only goes away once the consumer stream is dropped.
        self.tx.send(item).map_err(|_| QueueError::Closed)
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Take the consuming stream. Only one consumer is ever handed out.
    pub fn consume(&self) -> Result<BoxStream<'static, T>, QueueError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(QueueError::AlreadyConsumed)?;
        let closed = self.closed.clone();

        Ok(stream::unfold((rx, closed), |(mut rx, closed)| async move {
            let next = tokio::select! {
                biased;
                () = closed.cancelled() => None,
                item = rx.recv() => item,
            };
            next.map(|item| (item, (rx, closed)))
        })
        .fuse()
        .boxed())
    }
}

impl<T: Send + 'static> Default for InputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
