//! Notificator - fans the notification log out to registered consumers
//!
//! A single upstream subscription is shared by every consumer. It is opened
//! lazily by the first registration and dropped again when the last consumer
//! unregisters. Announcements from the subscription are processed strictly in
//! delivery order by one background task per subscription lifetime.
//!
//! Failure handling:
//! - A consumer whose queue is full is evicted alone
//! - A malformed announcement, a failed fetch, or a lost upstream connection
//!   evicts every consumer; each must re-register and re-sync from its new
//!   baseline revision

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sb_common::{Platform, UserContext};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::announcement::EventAnnouncement;
use crate::config::NotificatorConfig;
use crate::error::{NotifyError, QueueError};
use crate::queue::EventQueue;
use crate::registry::{ConsumerRegistry, Watermark};
use crate::store::{
    AnnouncementStream, ConnectionEvent, ConnectionFactory, HealthCallback, NotificationConnection,
    NotificationStore, NOTIFICATIONS_CHANNEL,
};
use crate::Result;

/// Why consumers were forcibly removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    QueueFull,
    QueueClosed,
    MalformedAnnouncement,
    FetchFailed,
    Disconnected,
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::QueueFull => "queue_full",
            EvictionReason::QueueClosed => "queue_closed",
            EvictionReason::MalformedAnnouncement => "malformed_announcement",
            EvictionReason::FetchFailed => "fetch_failed",
            EvictionReason::Disconnected => "disconnected",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream connection handle and listening state
#[derive(Default)]
struct Subscription {
    connection: Option<Box<dyn NotificationConnection>>,
    listening: bool,
}

pub struct Notificator {
    config: NotificatorConfig,
    store: Arc<dyn NotificationStore>,
    connection_factory: Arc<dyn ConnectionFactory>,

    started: AtomicBool,

    /// Upstream connection health, driven by the adapter's callback
    running: AtomicBool,

    /// Held across adapter calls. May be followed by the registry lock,
    /// never the other way round.
    subscription: Mutex<Subscription>,

    consumers: ConsumerRegistry,

    /// Advanced by the processing loop; its generation changes on every
    /// deactivation so a stale loop stops
    last_known_revision: Watermark,
}

impl Notificator {
    pub fn new(
        config: NotificatorConfig,
        store: Arc<dyn NotificationStore>,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            config,
            store,
            connection_factory,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            subscription: Mutex::new(Subscription::default()),
            consumers: ConsumerRegistry::new(),
            last_known_revision: Watermark::new(),
        }
    }

    /// Open the upstream connection without subscribing.
    ///
    /// The returned task waits for `shutdown`, then unsubscribes, evicts
    /// every consumer and closes the connection.
    pub async fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NotifyError::AlreadyStarted);
        }

        let notificator = Arc::downgrade(self);
        let on_event: HealthCallback = Arc::new(move |event| {
            if let Some(notificator) = notificator.upgrade() {
                notificator.handle_connection_event(event);
            }
        });

        // Health events raised while the connection opens must win
        self.running.store(true, Ordering::SeqCst);
        let connection = match self.connection_factory.new_connection(on_event).await {
            Ok(connection) => connection,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.started.store(false, Ordering::SeqCst);
                error!(error = %e, "Could not open notification connection");
                return Err(NotifyError::Connection(e));
            }
        };

        self.subscription.lock().await.connection = Some(connection);
        info!(
            queue_size = self.config.queue_size,
            running = self.is_running(),
            "Notificator started"
        );

        let notificator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _ = shutdown.recv().await;
            notificator.stop().await;
        }))
    }

    /// Register a consumer for the caller's platform.
    ///
    /// Returns the consumer's queue and the baseline revision: everything at
    /// or below it must be read from the store, everything after it arrives
    /// on the queue.
    pub async fn register_consumer(self: &Arc<Self>, user: Option<&UserContext>) -> Result<(EventQueue, i64)> {
        let platform = resolve_platform(user)?;

        if !self.is_running() {
            return Err(NotifyError::NotRunning);
        }

        let (queue, baseline) = {
            let mut subscription = self.subscription.lock().await;
            self.ensure_listening(&mut subscription).await?;

            let queue = EventQueue::new(self.config.queue_size);
            let baseline = self
                .consumers
                .add_with_baseline(&platform.id, queue.clone(), &self.last_known_revision);
            (queue, baseline)
        };
        self.record_consumer_count();

        info!(
            platform_id = %platform.id,
            queue_id = %queue.id(),
            revision = baseline,
            "Consumer registered"
        );
        Ok((queue, baseline))
    }

    /// Remove a consumer and close its queue.
    ///
    /// Removing the last consumer drops the upstream subscription.
    pub async fn unregister_consumer(&self, queue: &EventQueue) -> Result<()> {
        let (platform_id, removed) = self
            .consumers
            .remove(queue.id())
            .ok_or_else(|| NotifyError::ConsumerNotFound(queue.id().to_string()))?;
        removed.close();
        self.record_consumer_count();

        info!(platform_id = %platform_id, queue_id = %queue.id(), "Consumer unregistered");

        if self.consumers.is_empty() {
            let mut subscription = self.subscription.lock().await;
            // A registration may have slipped in while waiting for the lock
            if subscription.listening && self.consumers.is_empty() {
                self.stop_listening(&mut subscription).await;
            }
        }
        Ok(())
    }

    /// Apply an upstream connection state change
    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        let is_running = event.is_running();
        self.running.store(is_running, Ordering::SeqCst);

        match &event {
            ConnectionEvent::Connected => info!("Notification connection established"),
            ConnectionEvent::Reconnected => info!("Notification connection re-established"),
            ConnectionEvent::Disconnected(reason) => {
                warn!(reason = %reason, "Notification connection lost")
            }
            ConnectionEvent::ConnectionAttemptFailed(reason) => {
                warn!(reason = %reason, "Notification connection attempt failed")
            }
        }

        if !is_running {
            self.evict_all(EvictionReason::Disconnected);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn is_listening(&self) -> bool {
        self.subscription.lock().await.listening
    }

    /// Current watermark, `INVALID_REVISION` while not listening
    pub fn last_known_revision(&self) -> i64 {
        self.last_known_revision.get()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn platform_count(&self) -> usize {
        self.consumers.platform_count()
    }

    async fn ensure_listening(self: &Arc<Self>, subscription: &mut Subscription) -> Result<()> {
        if subscription.listening {
            return Ok(());
        }

        let connection = subscription.connection.as_mut().ok_or(NotifyError::NotRunning)?;

        let revision = self
            .store
            .last_revision()
            .await
            .map_err(|e| NotifyError::subscribe(NOTIFICATIONS_CHANNEL, e))?;
        let stream = connection
            .listen(NOTIFICATIONS_CHANNEL)
            .await
            .map_err(|e| NotifyError::subscribe(NOTIFICATIONS_CHANNEL, e))?;

        self.last_known_revision.set(revision);
        subscription.listening = true;
        let generation = self.last_known_revision.generation();

        let notificator = Arc::clone(self);
        tokio::spawn(async move {
            notificator.process_notifications(stream, generation).await;
        });

        info!(channel = NOTIFICATIONS_CHANNEL, revision, "Listening for notifications");
        Ok(())
    }

    async fn stop_listening(&self, subscription: &mut Subscription) {
        if let Some(connection) = subscription.connection.as_mut() {
            if let Err(e) = connection.unlisten(NOTIFICATIONS_CHANNEL).await {
                warn!(channel = NOTIFICATIONS_CHANNEL, error = %e, "Unlisten failed");
            }
        }
        subscription.listening = false;
        self.consumers.invalidate(&self.last_known_revision);

        info!(channel = NOTIFICATIONS_CHANNEL, "Stopped listening for notifications");
    }

    async fn stop(&self) {
        info!("Notificator shutting down");
        {
            let mut subscription = self.subscription.lock().await;
            if subscription.listening {
                self.stop_listening(&mut subscription).await;
            }
            if let Some(mut connection) = subscription.connection.take() {
                if let Err(e) = connection.close().await {
                    warn!(error = %e, "Failed to close notification connection");
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.evict_all(EvictionReason::Shutdown);
        info!("Notificator stopped");
    }

    async fn process_notifications(self: Arc<Self>, mut stream: AnnouncementStream, generation: u64) {
        debug!(generation, "Notification processing started");

        while let Some(payload) = stream.recv().await {
            if self.last_known_revision.generation() != generation {
                break;
            }
            if !self.process_announcement(&payload, generation).await {
                break;
            }
        }

        debug!(generation, "Notification processing stopped");
    }

    /// Returns `false` once the subscription lifetime `generation` has ended
    async fn process_announcement(&self, payload: &str, generation: u64) -> bool {
        let announcement = match EventAnnouncement::decode(payload) {
            Ok(announcement) => announcement,
            Err(e) => {
                error!(error = %e, payload = %payload, "Malformed notification announcement");
                self.evict_all(EvictionReason::MalformedAnnouncement);
                return true;
            }
        };

        let Some(recipients) = self.consumers.advance_and_select(
            &announcement.platform_id,
            announcement.revision,
            generation,
            &self.last_known_revision,
        ) else {
            return false;
        };
        if recipients.is_empty() {
            debug!(
                platform_id = %announcement.platform_id,
                revision = announcement.revision,
                "No consumers for notification"
            );
            return true;
        }

        let notification = match self.store.get_notification(&announcement.notification_id).await {
            Ok(notification) => notification,
            Err(e) => {
                error!(
                    notification_id = %announcement.notification_id,
                    revision = announcement.revision,
                    error = %e,
                    "Could not fetch notification"
                );
                self.evict_all(EvictionReason::FetchFailed);
                return true;
            }
        };

        for queue in recipients {
            match queue.enqueue(notification.clone()) {
                Ok(()) => {
                    metrics::counter!("sb_notify_delivered_total").increment(1);
                }
                Err(e @ QueueError::Full { .. }) => {
                    warn!(queue_id = %queue.id(), error = %e, "Consumer fell behind");
                    self.evict(&queue, EvictionReason::QueueFull);
                }
                Err(QueueError::Closed(_)) => {
                    debug!(queue_id = %queue.id(), "Consumer closed its queue");
                    self.evict(&queue, EvictionReason::QueueClosed);
                }
            }
        }

        debug!(
            notification_id = %notification.id,
            revision = notification.revision,
            "Notification dispatched"
        );
        true
    }

    fn evict(&self, queue: &EventQueue, reason: EvictionReason) {
        if let Some((platform_id, removed)) = self.consumers.remove(queue.id()) {
            removed.close();
            self.record_consumer_count();
            metrics::counter!("sb_notify_evictions_total", "reason" => reason.as_str()).increment(1);
            warn!(platform_id = %platform_id, queue_id = %queue.id(), reason = %reason, "Consumer evicted");
        }
    }

    /// Close every consumer queue and clear the registry
    fn evict_all(&self, reason: EvictionReason) {
        let evicted = self.consumers.drain();
        if evicted.is_empty() {
            return;
        }

        for queue in &evicted {
            queue.close();
        }
        self.record_consumer_count();
        metrics::counter!("sb_notify_evictions_total", "reason" => reason.as_str())
            .increment(evicted.len() as u64);
        warn!(count = evicted.len(), reason = %reason, "Evicted all consumers");
    }

    fn record_consumer_count(&self) {
        metrics::gauge!("sb_notify_consumers").set(self.consumers.len() as f64);
    }
}

fn resolve_platform(user: Option<&UserContext>) -> Result<Platform> {
    let user = user.ok_or_else(|| NotifyError::identity("user context is missing"))?;
    let platform: Platform = user
        .data()
        .map_err(|e| NotifyError::identity(format!("could not decode platform: {}", e)))?;
    if platform.id.is_empty() {
        return Err(NotifyError::identity("platform id not found in user context"));
    }
    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_common::AuthType;

    #[test]
    fn test_resolve_platform() {
        let platform = Platform {
            id: "k8s-1".to_string(),
            ..Default::default()
        };
        let ctx = UserContext::for_platform(&platform).unwrap();
        assert_eq!(resolve_platform(Some(&ctx)).unwrap().id, "k8s-1");
    }

    #[test]
    fn test_resolve_platform_failures() {
        assert!(matches!(resolve_platform(None), Err(NotifyError::Identity(_))));

        let malformed = UserContext::new("admin", AuthType::Bearer, "[1, 2");
        assert!(matches!(resolve_platform(Some(&malformed)), Err(NotifyError::Identity(_))));

        let no_id = UserContext::new("admin", AuthType::Basic, r#"{"name":"orphan"}"#);
        assert!(matches!(resolve_platform(Some(&no_id)), Err(NotifyError::Identity(_))));
    }

    #[test]
    fn test_eviction_reason_labels() {
        assert_eq!(EvictionReason::QueueFull.to_string(), "queue_full");
        assert_eq!(EvictionReason::Disconnected.as_str(), "disconnected");
    }
}
