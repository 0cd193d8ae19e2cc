//! # Ticker Alert Relay Server
//!
//! Accepts ticker alerts from WebSocket clients, broadcasts them to every
//! connected client, forwards them over an encrypted TCP session to an
//! upstream relay peer and persists them to JSON stores in quiet-period
//! batches.
//!
//! ## Functionality:
//! - **WebSocket endpoint** on `/ws`, plus `/health` and `/status`.
//! - **Relay client** with per-day AES-256 keys, heartbeats and reconnects.
//! - **Ignore lists** per sender, read when a client connects.
//! - **Daily backups** of both stores, driven by a cron job.
//! - **Graceful Shutdown** through `tokio-graceful`, bounded to ten seconds,
//!   with a final flush of buffered records.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use static_init::dynamic;
use tokio::net::TcpListener;
use tokio_graceful::Shutdown;
use tracing::info;

use servers::alert_logic::{config, logger, service};

// load .env files before anything else
#[dynamic]
#[allow(dead_code)]
static DOTENV_INIT: () = {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };

    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config().context("Invalid configuration")?;
    let _log_guard =
        logger::setup_logging(&settings.log_dir, &settings.log_level, service::APP_NAME)?;
    info!("Starting {} with {:?}", service::APP_NAME, settings);

    let addr = format!("{}:{}", settings.ws_host, settings.ws_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!("{} listening on {:?}", service::APP_NAME, local);

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| service::run(settings, listener, guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}
