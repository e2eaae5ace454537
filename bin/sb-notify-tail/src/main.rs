//! Service Broker Notification Tail
//!
//! Registers one consumer for a platform and logs every notification it
//! receives. When the consumer is evicted the tail re-registers and reports
//! the new baseline revision, from which a real client would re-sync.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SB_DATABASE_URL` | - | PostgreSQL connection URL (required) |
//! | `SB_PLATFORM_ID` | - | Platform to tail (required) |
//! | `SB_INIT_SCHEMA` | `false` | Create the notifications table and trigger |
//! | `SB_METRICS_PORT` | - | Prometheus exporter port, disabled when unset |
//! | `SB_NOTIFICATION_QUEUE_SIZE` | `100` | Consumer queue capacity |
//! | `SB_NOTIFICATION_MIN_RECONNECT_MS` | `200` | Initial reconnect backoff |
//! | `SB_NOTIFICATION_MAX_RECONNECT_MS` | `20000` | Maximum reconnect backoff |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sb_common::{Platform, UserContext};
use sb_notify::postgres::{PgConnectionFactory, PostgresNotificationStore};
use sb_notify::{Notificator, NotificatorConfig};

/// Service Broker Notification Tail
#[derive(Parser, Debug)]
#[command(name = "sb-notify-tail")]
#[command(about = "Stream a platform's notifications to the log")]
struct Args {
    /// PostgreSQL connection URL
    #[arg(long, env = "SB_DATABASE_URL")]
    database_url: String,

    /// Platform whose notifications to tail
    #[arg(long, env = "SB_PLATFORM_ID")]
    platform_id: String,

    /// Create the notifications table and announcement trigger on startup
    #[arg(long, env = "SB_INIT_SCHEMA", default_value = "false")]
    init_schema: bool,

    /// Prometheus exporter port
    #[arg(long, env = "SB_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Database pool size
    #[arg(long, env = "SB_DATABASE_MAX_CONNECTIONS", default_value = "5")]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    let args = Args::parse();
    info!(platform_id = %args.platform_id, "Starting notification tail");

    let config = NotificatorConfig::from_env();
    config.validate()?;
    let retry_interval = config.min_reconnect_interval();

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Metrics exporter listening on http://{}/metrics", addr);
    }

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await?;

    let store = PostgresNotificationStore::new(pool.clone());
    if args.init_schema {
        store.init_schema().await?;
        info!("Notification schema initialized");
    }

    let connection_factory = PgConnectionFactory::new(pool, &config);
    let notificator = Arc::new(Notificator::new(config, Arc::new(store), Arc::new(connection_factory)));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let notificator_handle = notificator.start(shutdown_tx.subscribe()).await?;

    let platform = Platform {
        id: args.platform_id.clone(),
        name: args.platform_id,
        ..Default::default()
    };
    let user = UserContext::for_platform(&platform)?;

    let tail_handle = {
        let notificator = notificator.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tail(notificator, user, retry_interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("Tail shutting down");
                }
            }
        })
    };

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = tail_handle.await;
        let _ = notificator_handle.await;
    })
    .await;

    info!("Notification tail shutdown complete");
    Ok(())
}

/// Register, drain until evicted, repeat
async fn tail(notificator: Arc<Notificator>, user: UserContext, retry_interval: Duration) {
    loop {
        let (queue, baseline) = match notificator.register_consumer(Some(&user)).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(error = %e, retry_in_ms = retry_interval.as_millis() as u64, "Registration failed");
                tokio::time::sleep(retry_interval).await;
                continue;
            }
        };
        info!(queue_id = %queue.id(), revision = baseline, "Tailing notifications after baseline");

        while let Some(notification) = queue.next().await {
            info!(
                id = %notification.id,
                platform_id = %notification.platform_id,
                revision = notification.revision,
                operation = notification.operation.as_str(),
                resource = %notification.resource,
                payload = %notification.payload,
                "Notification"
            );
        }

        warn!(queue_id = %queue.id(), "Consumer evicted, re-registering");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
