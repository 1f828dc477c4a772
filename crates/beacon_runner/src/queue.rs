//! In-process FIFO work queue between the outbox publisher and workers.

use beacon_protocol::QueueEnvelope;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,

    #[error("work queue is closed")]
    Closed,
}

/// Producer handle. Enqueue is non-blocking so the outbox publisher can
/// treat a full queue as a retryable failure.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<QueueEnvelope>,
}

impl WorkQueue {
    pub fn try_enqueue(&self, envelope: QueueEnvelope) -> Result<(), QueueError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Readiness probe.
    pub fn ping(&self) -> Result<(), QueueError> {
        if self.tx.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn capacity_remaining(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer handle, shared by the worker pool.
#[derive(Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<QueueEnvelope>>>,
}

impl WorkReceiver {
    /// Next envelope, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<QueueEnvelope> {
        self.rx.lock().await.recv().await
    }
}

pub fn work_queue(capacity: usize) -> (WorkQueue, WorkReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        WorkQueue { tx },
        WorkReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope(id: &str) -> QueueEnvelope {
        QueueEnvelope {
            id: id.to_string(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let (queue, receiver) = work_queue(8);
        queue.try_enqueue(envelope("a")).unwrap();
        queue.try_enqueue(envelope("b")).unwrap();
        queue.try_enqueue(envelope("c")).unwrap();

        assert_eq!(receiver.recv().await.unwrap().id, "a");
        assert_eq!(receiver.recv().await.unwrap().id, "b");
        assert_eq!(receiver.recv().await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn full_queue_reports_without_blocking() {
        let (queue, _receiver) = work_queue(1);
        queue.try_enqueue(envelope("a")).unwrap();
        assert!(matches!(
            queue.try_enqueue(envelope("b")),
            Err(QueueError::Full)
        ));
    }

    #[tokio::test]
    async fn closed_queue_fails_ping() {
        let (queue, receiver) = work_queue(1);
        assert!(queue.ping().is_ok());
        drop(receiver);
        // Receiver dropped: sends fail, ping reports closed.
        assert!(matches!(
            queue.try_enqueue(envelope("a")),
            Err(QueueError::Closed)
        ));
        assert!(queue.ping().is_err());
    }
}
