//! Store adapter contract
//!
//! The notification log and its listen/notify primitive live outside this
//! crate. Implementations are supplied by the surrounding system; a
//! PostgreSQL one ships behind the `postgres` feature.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sb_common::Notification;
use tokio::sync::mpsc;

/// Channel every producer notifies on
pub const NOTIFICATIONS_CHANNEL: &str = "notifications";

/// Raw announcement payloads for one subscription lifetime
pub type AnnouncementStream = mpsc::Receiver<String>;

/// Invoked by the adapter whenever the upstream connection changes state
pub type HealthCallback = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Upstream connection state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnected,
    Disconnected(String),
    ConnectionAttemptFailed(String),
}

impl ConnectionEvent {
    pub fn is_running(&self) -> bool {
        matches!(self, ConnectionEvent::Connected | ConnectionEvent::Reconnected)
    }
}

/// Read access to the notification log
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Highest revision in the log, 0 when the log is empty
    async fn last_revision(&self) -> Result<i64>;

    /// Fetch a notification by id. Not found is an error.
    async fn get_notification(&self, id: &str) -> Result<Notification>;
}

/// A live upstream connection
#[async_trait]
pub trait NotificationConnection: Send + Sync {
    /// Subscribe to `channel`. The returned stream ends on unlisten or close.
    async fn listen(&mut self, channel: &str) -> Result<AnnouncementStream>;

    async fn unlisten(&mut self, channel: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens upstream connections, arming the health callback at construction
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn new_connection(&self, on_event: HealthCallback) -> Result<Box<dyn NotificationConnection>>;
}
