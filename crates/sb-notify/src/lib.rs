//! Service Broker Notification Engine
//!
//! Turns the revision-ordered notification log into live, resumable,
//! per-platform event streams:
//! - Notificator: owns the upstream subscription, consumer registry and watermark
//! - EventQueue: bounded per-consumer mailbox that closes instead of blocking
//! - store: the adapter contract for the notification log and its listen/notify channel
//! - postgres: PostgreSQL adapter (feature `postgres`)

pub mod announcement;
pub mod config;
pub mod error;
pub mod notificator;
pub mod queue;
mod registry;
pub mod store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use announcement::EventAnnouncement;
pub use config::NotificatorConfig;
pub use error::{NotifyError, QueueError};
pub use notificator::{EvictionReason, Notificator};
pub use queue::EventQueue;
pub use registry::INVALID_REVISION;
pub use store::{
    AnnouncementStream, ConnectionEvent, ConnectionFactory, HealthCallback, NotificationConnection,
    NotificationStore, NOTIFICATIONS_CHANNEL,
};

pub type Result<T> = std::result::Result<T, NotifyError>;
