//! Event Queue - bounded per-consumer mailbox
//!
//! One producer (the notificator) and one reader (the consumer). The producer
//! never waits: when the buffer is full the queue closes itself and the
//! enqueue fails, so a slow consumer can never stall the processing loop.
//! Either side may close the queue; closing is idempotent and discards
//! anything still buffered.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use sb_common::Notification;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::QueueError;

struct QueueState {
    items: VecDeque<Notification>,
    closed: bool,
    /// Readers currently parked in `next()`
    waiting: usize,
}

struct Shared {
    id: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Bounded, closable, non-blocking notification queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<Shared>,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` undelivered notifications.
    ///
    /// A capacity of zero is a rendezvous queue: an enqueue only succeeds
    /// while the reader is parked waiting for the next item.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: uuid::Uuid::new_v4().to_string(),
                capacity,
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                    waiting: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of buffered, undelivered notifications
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Append without waiting.
    ///
    /// A full buffer closes the queue; the caller must treat the error as
    /// "this consumer fell behind" and must not retry.
    pub fn enqueue(&self, notification: Notification) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Closed(self.shared.id.clone()));
        }

        if state.items.len() >= self.shared.capacity + state.waiting {
            state.closed = true;
            state.items.clear();
            drop(state);
            self.shared.notify.notify_one();
            debug!(queue_id = %self.shared.id, capacity = self.shared.capacity, "Queue full, closed");
            return Err(QueueError::Full {
                queue_id: self.shared.id.clone(),
                capacity: self.shared.capacity,
            });
        }

        state.items.push_back(notification);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Close the queue. Safe to call repeatedly and from any task.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.items.clear();
        drop(state);

        self.shared.notify.notify_one();
        debug!(queue_id = %self.shared.id, "Queue closed");
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` once the queue is closed. Only one task may read.
    pub async fn next(&self) -> Option<Notification> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                state.waiting += 1;
            }
            let _parked = Parked(&self.shared);
            self.shared.notify.notified().await;
        }
    }

    /// Consume the handle into a stream that ends when the queue closes
    pub fn into_stream(self) -> impl Stream<Item = Notification> + Send + 'static {
        stream::unfold(self, |queue| async move {
            let item = queue.next().await?;
            Some((item, queue))
        })
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("id", &self.shared.id)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Unparks the reader even when `next()` is dropped mid-wait
struct Parked<'a>(&'a Shared);

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.state.lock().waiting -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use sb_common::NotificationOperation;
    use std::time::Duration;
    use tokio::time::timeout;

    fn create_test_notification(id: &str, revision: i64) -> Notification {
        Notification {
            id: id.to_string(),
            platform_id: "platform-1".to_string(),
            revision,
            operation: NotificationOperation::Created,
            resource: "/v1/service_brokers".to_string(),
            payload: serde_json::json!({ "id": id }),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new(3);
        queue.enqueue(create_test_notification("n-1", 1)).unwrap();
        queue.enqueue(create_test_notification("n-2", 2)).unwrap();
        queue.enqueue(create_test_notification("n-3", 3)).unwrap();
        assert_eq!(queue.len(), 3);

        for expected in ["n-1", "n-2", "n-3"] {
            assert_eq!(queue.next().await.unwrap().id, expected);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_closes() {
        let queue = EventQueue::new(2);
        queue.enqueue(create_test_notification("n-1", 1)).unwrap();
        queue.enqueue(create_test_notification("n-2", 2)).unwrap();

        let err = queue.enqueue(create_test_notification("n-3", 3)).unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 2, .. }));
        assert!(queue.is_closed());
        assert_eq!(queue.next().await, None);

        let err = queue.enqueue(create_test_notification("n-4", 4)).unwrap_err();
        assert_eq!(err, QueueError::Closed(queue.id().to_string()));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_discards() {
        let queue = EventQueue::new(5);
        queue.enqueue(create_test_notification("n-1", 1)).unwrap();

        queue.close();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_parked_reader() {
        let queue = EventQueue::new(1);
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_zero_capacity_without_reader_fails() {
        let queue = EventQueue::new(0);
        let err = queue.enqueue(create_test_notification("n-1", 1)).unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 0, .. }));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_zero_capacity_hands_off_to_parked_reader() {
        let queue = EventQueue::new(0);
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        // Let the reader park
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(create_test_notification("n-1", 1)).unwrap();

        let received = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(received.unwrap().id, "n-1");
        assert!(!queue.is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_reader_does_not_reserve_space() {
        let queue = EventQueue::new(0);
        let _ = timeout(Duration::from_millis(10), queue.next()).await;

        assert!(queue.enqueue(create_test_notification("n-1", 1)).is_err());
    }

    #[tokio::test]
    async fn test_stream_ends_on_close() {
        let queue = EventQueue::new(4);
        queue.enqueue(create_test_notification("n-1", 1)).unwrap();
        queue.enqueue(create_test_notification("n-2", 2)).unwrap();

        let mut stream = Box::pin(queue.clone().into_stream());
        assert_eq!(stream.next().await.unwrap().revision, 1);
        assert_eq!(stream.next().await.unwrap().revision, 2);

        queue.close();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = EventQueue::new(1);
        let b = EventQueue::new(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
