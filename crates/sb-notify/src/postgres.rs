//! PostgreSQL store adapter
//!
//! Notifications live in the `notifications` table. An insert trigger
//! publishes the announcement on the `notifications` channel with
//! `pg_notify`, and a [`PgListener`] driver task turns those into
//! announcement streams, reconnecting with exponential backoff when the
//! connection drops.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sb_common::{Notification, NotificationOperation};
use sqlx::postgres::{PgListener, PgNotification, PgPool};
use sqlx::Row;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::NotificatorConfig;
use crate::store::{
    AnnouncementStream, ConnectionEvent, ConnectionFactory, HealthCallback, NotificationConnection,
    NotificationStore,
};

/// Announcements buffered per channel before the driver waits on the reader
const ANNOUNCEMENT_BUFFER: usize = 1024;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    platform_id TEXT NOT NULL DEFAULT '',
    revision BIGSERIAL UNIQUE,
    type TEXT NOT NULL,
    resource TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_notifications_platform ON notifications(platform_id);

CREATE OR REPLACE FUNCTION announce_notification() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('notifications', json_build_object(
        'platform_id', NEW.platform_id,
        'notification_id', NEW.id,
        'revision', NEW.revision
    )::text);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS notifications_announce ON notifications;
CREATE TRIGGER notifications_announce
    AFTER INSERT ON notifications
    FOR EACH ROW EXECUTE FUNCTION announce_notification();
"#;

pub struct PostgresNotificationStore {
    pool: PgPool,
}

impl PostgresNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Append a notification; the store assigns its revision
    pub async fn insert(
        &self,
        platform_id: &str,
        operation: NotificationOperation,
        resource: &str,
        payload: serde_json::Value,
    ) -> Result<Notification> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = sqlx::query(
            "INSERT INTO notifications (id, platform_id, type, resource, payload) VALUES ($1, $2, $3, $4, $5) RETURNING revision, created_at"
        )
        .bind(&id)
        .bind(platform_id)
        .bind(operation.as_str())
        .bind(resource)
        .bind(payload.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(Notification {
            id,
            platform_id: platform_id.to_string(),
            revision: row.try_get("revision")?,
            operation,
            resource: resource.to_string(),
            payload,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    async fn last_revision(&self) -> Result<i64> {
        let revision: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) FROM notifications")
            .fetch_one(&self.pool)
            .await?;
        Ok(revision)
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        let row = sqlx::query(
            "SELECT id, platform_id, revision, type, resource, payload, created_at FROM notifications WHERE id = $1"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("notification {} not found", id))?;

        let operation: String = row.try_get("type")?;
        let payload: String = row.try_get("payload")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Notification {
            id: row.try_get("id")?,
            platform_id: row.try_get("platform_id")?,
            revision: row.try_get("revision")?,
            operation: operation.parse().map_err(|e: String| anyhow!(e))?,
            resource: row.try_get("resource")?,
            payload: serde_json::from_str(&payload)?,
            created_at,
        })
    }
}

/// Opens [`PgListener`]-backed connections
pub struct PgConnectionFactory {
    pool: PgPool,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl PgConnectionFactory {
    pub fn new(pool: PgPool, config: &NotificatorConfig) -> Self {
        Self {
            pool,
            min_reconnect_interval: config.min_reconnect_interval(),
            max_reconnect_interval: config.max_reconnect_interval(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn new_connection(&self, on_event: HealthCallback) -> Result<Box<dyn NotificationConnection>> {
        let listener = PgListener::connect_with(&self.pool).await?;
        on_event(ConnectionEvent::Connected);

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let driver = ListenerDriver {
            pool: self.pool.clone(),
            listener: Some(listener),
            commands: commands_rx,
            channels: HashMap::new(),
            on_event,
            backoff: self.min_reconnect_interval,
            min_reconnect_interval: self.min_reconnect_interval,
            max_reconnect_interval: self.max_reconnect_interval,
        };
        tokio::spawn(driver.run());

        Ok(Box::new(PgNotificationConnection { commands: commands_tx }))
    }
}

enum Command {
    Listen {
        channel: String,
        reply: oneshot::Sender<Result<AnnouncementStream>>,
    },
    Unlisten {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a listener driver task
pub struct PgNotificationConnection {
    commands: mpsc::Sender<Command>,
}

impl PgNotificationConnection {
    async fn request<T>(&self, command: Command, reply: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("notification connection is closed"))?;
        reply
            .await
            .map_err(|_| anyhow!("notification connection is closed"))?
    }
}

#[async_trait]
impl NotificationConnection for PgNotificationConnection {
    async fn listen(&mut self, channel: &str) -> Result<AnnouncementStream> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Listen { channel: channel.to_string(), reply }, rx).await
    }

    async fn unlisten(&mut self, channel: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Unlisten { channel: channel.to_string(), reply }, rx).await
    }

    async fn close(&mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }, rx).await
    }
}

/// Owns the listener; forwards payloads and reconnects on loss
struct ListenerDriver {
    pool: PgPool,
    /// `None` while disconnected
    listener: Option<PgListener>,
    commands: mpsc::Receiver<Command>,
    channels: HashMap<String, mpsc::Sender<String>>,
    on_event: HealthCallback,
    backoff: Duration,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl ListenerDriver {
    async fn run(mut self) {
        loop {
            let keep_running = match self.listener.as_mut() {
                Some(listener) => tokio::select! {
                    command = self.commands.recv() => self.handle_command(command).await,
                    received = listener.try_recv() => {
                        self.handle_received(received).await;
                        true
                    }
                },
                None => tokio::select! {
                    command = self.commands.recv() => self.handle_command(command).await,
                    _ = tokio::time::sleep(self.backoff) => {
                        self.reconnect().await;
                        true
                    }
                },
            };

            if !keep_running {
                break;
            }
        }

        self.channels.clear();
        debug!("Notification listener driver stopped");
    }

    async fn handle_command(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Listen { channel, reply }) => {
                let _ = reply.send(self.listen(channel).await);
                true
            }
            Some(Command::Unlisten { channel, reply }) => {
                self.channels.remove(&channel);
                let result = match self.listener.as_mut() {
                    Some(listener) => listener.unlisten(&channel).await.map_err(Into::into),
                    None => Ok(()),
                };
                let _ = reply.send(result);
                true
            }
            Some(Command::Close { reply }) => {
                self.listener = None;
                let _ = reply.send(Ok(()));
                info!("Notification connection closed");
                false
            }
            None => false,
        }
    }

    async fn listen(&mut self, channel: String) -> Result<AnnouncementStream> {
        let listener = self
            .listener
            .as_mut()
            .ok_or_else(|| anyhow!("notification connection is down"))?;
        listener.listen(&channel).await?;

        let (tx, rx) = mpsc::channel(ANNOUNCEMENT_BUFFER);
        self.channels.insert(channel, tx);
        Ok(rx)
    }

    async fn handle_received(&mut self, received: std::result::Result<Option<PgNotification>, sqlx::Error>) {
        match received {
            Ok(Some(notification)) => {
                let channel = notification.channel().to_string();
                let Some(tx) = self.channels.get(&channel) else {
                    return;
                };
                if tx.send(notification.payload().to_string()).await.is_err() {
                    debug!(channel = %channel, "Announcement reader gone, dropping channel");
                    self.channels.remove(&channel);
                }
            }
            Ok(None) => self.connection_lost("connection closed by server".to_string()),
            Err(e) => self.connection_lost(e.to_string()),
        }
    }

    fn connection_lost(&mut self, reason: String) {
        warn!(reason = %reason, "Notification listener disconnected");
        self.listener = None;
        self.backoff = self.min_reconnect_interval;
        (self.on_event)(ConnectionEvent::Disconnected(reason));
    }

    async fn reconnect(&mut self) {
        match self.connect().await {
            Ok(listener) => {
                self.listener = Some(listener);
                self.backoff = self.min_reconnect_interval;
                info!(channels = self.channels.len(), "Notification listener reconnected");
                (self.on_event)(ConnectionEvent::Reconnected);
            }
            Err(e) => {
                self.backoff = next_backoff(self.backoff, self.max_reconnect_interval);
                warn!(
                    error = %e,
                    retry_in_ms = self.backoff.as_millis() as u64,
                    "Notification listener reconnect failed"
                );
                (self.on_event)(ConnectionEvent::ConnectionAttemptFailed(e.to_string()));
            }
        }
    }

    async fn connect(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let channels: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        if !channels.is_empty() {
            listener.listen_all(channels).await?;
        }
        Ok(listener)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
