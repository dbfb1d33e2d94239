use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agent_pod::mode::{self, Mode};
use agent_pod::orphan::{ChannelOrphanSource, OrphanSource, TimedOrphanSource};
use agent_pod::pipeline::detector::DetectorStreamer;
use agent_pod::pipeline::streamer::Streamer;
use agent_pod::pipeline::Services;
use common::config::Config;
use common::inference::FakeInference;
use common::registry::{FileRegistry, Registry};
use common::storage::LocalStorage;
use common::video::FfmpegOpener;
use common::vms::FakeVms;
use common::webhook::{HttpWebhook, NoopWebhook, Webhook};

/// Must exceed the mode loop's own shutdown drain.
const WAIT_ON_SHUTDOWN: Duration = Duration::from_secs(8);

#[tokio::main]
async fn main() -> Result<()> {
    // Env file only exists in dev; missing there is a misconfiguration.
    let run_time_env = std::env::var("RUN_TIME_ENV").unwrap_or_default();
    let dev = run_time_env.is_empty() || run_time_env == "dev";
    if dev {
        dotenvy::dotenv().context("error loading .env file")?;
    }

    telemetry::init_with_service("agent-pod");

    let mode: Mode = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "manager".to_string())
        .parse()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    info!(?mode, dev, "agents pod starting");

    let config = Arc::new(Config::from_env());
    tokio::fs::create_dir_all(&config.recordings_folder)
        .await
        .context("error creating recordings folder")?;

    let registry: Arc<dyn Registry> = Arc::new(FileRegistry::new(
        config.settings_folder.clone(),
        config.orphan_stale_after,
    ));
    let webhook: Arc<dyn Webhook> = match &config.webhook_url {
        Some(url) => Arc::new(HttpWebhook::new(url.clone())),
        None => Arc::new(NoopWebhook),
    };
    let services = Services {
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
        storage: Arc::new(LocalStorage),
        vms: Arc::new(FakeVms),
        inference: Arc::new(FakeInference),
        webhook,
        video: Arc::new(FfmpegOpener),
    };

    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    // The manager consumes orphan announcements; in dev those come from
    // the timed walker. The monitor publishes into the shared channel.
    let orphan: Arc<dyn OrphanSource> = match mode {
        Mode::Manager => Arc::new(
            TimedOrphanSource::new(root.child_token(), Arc::clone(&registry)).await?,
        ),
        Mode::Monitor => Arc::new(ChannelOrphanSource::new(root.child_token())),
    };

    let streamers: Vec<Arc<dyn Streamer>> = vec![Arc::new(DetectorStreamer)];

    let mode_cancel = root.child_token();
    let mut mode_task = tokio::spawn(async move {
        match mode {
            Mode::Manager => mode::manager::run(mode_cancel, services, orphan, streamers).await,
            Mode::Monitor => mode::monitor::run(mode_cancel, services, orphan).await,
        }
    });

    let finished = tokio::select! {
        _ = root.cancelled() => None,
        result = &mut mode_task => Some(result),
    };

    match finished {
        Some(result) => {
            // The mode loop exited on its own; tear the pod down.
            log_mode_result(result);
            root.cancel();
        }
        None => {
            info!("agents pod cancelled");
            info!("agents pod is waiting for all tasks to exit");
            match tokio::time::timeout(WAIT_ON_SHUTDOWN, &mut mode_task).await {
                Ok(result) => log_mode_result(result),
                Err(_) => info!(
                    period = ?WAIT_ON_SHUTDOWN,
                    "agents pod shutdown waiting period expired, exiting now"
                ),
            }
        }
    }

    Ok(())
}

fn log_mode_result(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("mode processor exited"),
        Ok(Err(err)) => error!(error = %format!("{err:#}"), "mode processor exited with error"),
        Err(err) => error!(error = %err, "mode processor panicked"),
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}
