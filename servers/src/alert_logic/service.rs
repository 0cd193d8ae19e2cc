//! Wiring of the relay client, the hub, the batch governor and the backup
//! job, plus their ordered shutdown.

use std::sync::Arc;

use lib_relay::connections::{RelayClient, RelayConfig, TcpConnector};
use lib_relay::core::{BackupScheduler, BatchGovernor, BroadcastHub, HubConfig, JsonStore};
use lib_relay::loggers::{LogNotifier, Notifier, NotifyLevel, TelegramNotifier};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_graceful::ShutdownGuard;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::alert_logic::config::Settings;
use crate::alert_logic::downstream;
use crate::alert_logic::state::AppState;

pub const APP_NAME: &str = "server_alerts";

pub fn build_notifier(settings: &Settings) -> Arc<dyn Notifier> {
    match &settings.telegram {
        Some(telegram) => Arc::new(TelegramNotifier::new(
            telegram.bot_token.clone(),
            telegram.chat_id.clone(),
            APP_NAME,
            settings.timezone,
        )),
        None => {
            warn!("No Telegram credentials; notifications go to the log only");
            Arc::new(LogNotifier)
        }
    }
}

/// The running pipeline behind the WebSocket endpoint.
pub struct Pipeline {
    pub hub: Arc<BroadcastHub>,
    pub relay: RelayClient,
    pub backups: Arc<BackupScheduler>,
    sessions: TaskTracker,
    governor_cancel: CancellationToken,
    relay_task: JoinHandle<()>,
    governor_task: JoinHandle<()>,
}

impl Pipeline {
    /// Starts the relay worker, which stops on `cancel`, and the governor,
    /// which only stops from [`Pipeline::join`].
    pub fn start(
        settings: &Settings,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Self {
        let connector = TcpConnector::new(
            &settings.relay_host,
            settings.relay_port,
            settings.connect_timeout,
        );
        let mut relay_config =
            RelayConfig::new(settings.relay_username.clone(), settings.relay_secret.clone());
        relay_config.heartbeat_interval = settings.heartbeat_interval;
        relay_config.reconnect_delay = settings.reconnect_delay;
        let (relay, relay_task) = RelayClient::start(connector, relay_config, cancel.clone());

        let accepted_store = Arc::new(JsonStore::new(&settings.messages_path));
        let ignored_store = Arc::new(JsonStore::new(&settings.ignored_path));
        let governor = Arc::new(BatchGovernor::new(
            accepted_store.clone(),
            ignored_store.clone(),
            settings.save_delay,
        ));
        let governor_cancel = CancellationToken::new();
        let governor_task = tokio::spawn(governor.clone().run(governor_cancel.clone()));

        let hub = Arc::new(BroadcastHub::new(
            Arc::new(relay.clone()),
            governor,
            notifier,
            HubConfig {
                session_queue_capacity: settings.session_queue_capacity,
                timezone: settings.timezone,
                ignore_list_path: settings.ignore_list_path.clone(),
            },
        ));

        let backups = Arc::new(BackupScheduler::new(
            vec![accepted_store, ignored_store],
            settings.backup_dir.clone(),
        ));

        Self {
            hub,
            relay,
            backups,
            sessions: TaskTracker::new(),
            governor_cancel,
            relay_task,
            governor_task,
        }
    }

    pub fn app_state(&self, settings: &Settings, cancel: CancellationToken) -> AppState {
        AppState {
            hub: self.hub.clone(),
            relay: self.relay.clone(),
            send_timeout: settings.fanout_send_timeout,
            cancel,
            sessions: self.sessions.clone(),
        }
    }

    /// Stops the pipeline once the token given to [`Pipeline::start`] and
    /// [`Pipeline::app_state`] has fired.
    ///
    /// The hub is closed to new alerts and every session task is awaited
    /// before the governor is cancelled, so its final flush sees every
    /// record the hub accepted.
    pub async fn join(self) {
        self.hub.close();

        self.sessions.close();
        self.sessions.wait().await;
        info!("All WebSocket sessions ended");

        if let Err(e) = self.relay_task.await {
            error!("Relay worker ended abnormally: {}", e);
        }

        self.governor_cancel.cancel();
        if let Err(e) = self.governor_task.await {
            error!("Batch governor ended abnormally: {}", e);
        }
    }
}

/// Registers the daily backup job.
pub async fn start_backup_job(
    backups: Arc<BackupScheduler>,
    cron: &str,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let backups = backups.clone();
        Box::pin(async move {
            let report = backups.run_today().await;
            info!(
                "Daily backup: {} copied, {} skipped, {} failed",
                report.copied, report.skipped, report.failed
            );
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

/// # Service Main
///
/// Runs until the shutdown guard fires, then stops every component in order:
/// the endpoint, the backup job, the WebSocket sessions and the relay worker,
/// and last the governor with its final flush.
pub async fn run(settings: Settings, listener: TcpListener, shutdown_guard: ShutdownGuard) {
    let cancel = CancellationToken::new();
    let notifier = build_notifier(&settings);
    let pipeline = Pipeline::start(&settings, notifier.clone(), cancel.clone());

    let startup_backup = pipeline.backups.run_today().await;
    info!(
        "Startup backup: {} copied, {} skipped, {} failed",
        startup_backup.copied, startup_backup.skipped, startup_backup.failed
    );

    let backup_job = start_backup_job(pipeline.backups.clone(), &settings.backup_cron).await;
    let mut scheduler = match backup_job {
        Ok(scheduler) => Some(scheduler),
        Err(e) => {
            error!("Backup job not scheduled ({}): {}", settings.backup_cron, e);
            notifier.notify(&format!("Backup job not scheduled: {}", e), NotifyLevel::Error);
            None
        }
    };

    let app_state = pipeline.app_state(&settings, cancel.clone());
    let server = tokio::spawn(downstream::serve(listener, app_state));

    shutdown_guard.cancelled().await;
    info!("Signal received: initiate graceful shutdown");
    cancel.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Downstream server failed: {}", e),
        Err(e) => error!("Downstream server task ended abnormally: {}", e),
    }

    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(e) = scheduler.shutdown().await {
            warn!("Backup scheduler shutdown failed: {}", e);
        }
    }

    pipeline.join().await;
    info!("Pipeline stopped");
}
