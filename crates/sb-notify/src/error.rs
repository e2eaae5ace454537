//! Notification engine error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notificator already started")]
    AlreadyStarted,

    #[error("could not open connection to database: {0}")]
    Connection(#[source] anyhow::Error),

    #[error("could not resolve platform from user context: {0}")]
    Identity(String),

    #[error("cannot register consumer - notificator is not running")]
    NotRunning,

    #[error("listen to {channel} channel failed: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("consumer {0} was not found")]
    ConsumerNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl NotifyError {
    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity(message.into())
    }

    pub fn subscribe(channel: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            source,
        }
    }
}

/// Errors reported by [`EventQueue::enqueue`](crate::EventQueue::enqueue)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {queue_id} is full (capacity {capacity}), closing")]
    Full { queue_id: String, capacity: usize },

    #[error("queue {0} is closed")]
    Closed(String),
}
