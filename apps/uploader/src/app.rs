//! Application orchestrator: wires the uploader components together.

use std::sync::Arc;
use std::time::Duration;

use mydata_metadata::HttpMetadataService;
use mydata_model::{RecordStatus, StatusEvent, UploadStatus, VerificationStatus};
use mydata_pipeline::Coordinator;
use mydata_scheduler::{PipelineRunner, Scheduler};
use mydata_transfer::{SshEndpoint, Uploader};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Config;

/// Runs the uploader until Ctrl-C, or for a single cycle with `once`.
pub async fn run(config: Config, once: bool) -> anyhow::Result<()> {
    // -- Remote side --
    if config.remote.host.is_empty() {
        anyhow::bail!("remote.host is not configured");
    }
    let endpoint = Arc::new(SshEndpoint::new(config.ssh_config()));
    let protocol =
        Arc::new(Uploader::new(endpoint).with_scratch_dir(config.remote.scratch_dir.clone()));

    let metadata = Arc::new(HttpMetadataService::new(
        &config.metadata.base_url,
        &config.metadata.username,
        &config.metadata.api_key,
        Duration::from_secs(config.metadata.timeout_secs),
    )?);

    // -- Pipelines --
    let coordinator = Arc::new(Coordinator::new(
        metadata,
        protocol,
        config.pipeline_config(),
    ));
    if let Some(events) = coordinator.take_events() {
        tokio::spawn(log_events(events));
    }

    if once {
        return run_once(&coordinator, &config).await;
    }

    // -- Scheduler --
    let runner = Arc::new(PipelineRunner::new(
        Arc::clone(&coordinator),
        config.data_directory.clone(),
    ));
    let scheduler = Scheduler::new(runner);
    match scheduler.apply(config.schedule.clone()).await? {
        Some(at) => tracing::info!(at = %at, "first cycle armed"),
        None => tracing::info!("no automatic cycles, send SIGUSR1 to start one"),
    }

    wait_for_shutdown(&scheduler).await?;

    // -- Graceful shutdown --
    tracing::info!("stopping scheduler...");
    scheduler.stop().await;
    Ok(())
}

async fn run_once(coordinator: &Coordinator, config: &Config) -> anyhow::Result<()> {
    let cycle = coordinator.start_cycle(&config.data_directory);
    tokio::pin!(cycle);

    let result = tokio::select! {
        result = &mut cycle => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            let (result, ()) = tokio::join!(&mut cycle, coordinator.cancel_all());
            result
        }
    };
    let summary = result?;
    tracing::info!(
        uploaded = summary.uploaded,
        upload_failures = summary.upload_failures,
        "single cycle done"
    );
    Ok(())
}

/// Waits for Ctrl-C, starting a cycle on every SIGUSR1 meanwhile.
#[cfg(unix)]
async fn wait_for_shutdown(scheduler: &Scheduler) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("SIGINT received, shutting down");
                return Ok(());
            }
            _ = usr1.recv() => {
                tracing::info!("SIGUSR1 received, starting a cycle");
                scheduler.run_now().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_scheduler: &Scheduler) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");
    Ok(())
}

/// Logs status events; progress goes to debug.
async fn log_events(mut events: UnboundedReceiver<StatusEvent>) {
    while let Some(event) = events.recv().await {
        let record = event.record_id;
        let file = &event.file;
        let message = event.message.as_deref().unwrap_or_default();
        match event.status {
            RecordStatus::Upload(UploadStatus::InProgress) => {
                if let Some(p) = &event.progress {
                    tracing::debug!(
                        record,
                        file = %file,
                        percent = p.percent,
                        bytes_per_second = p.bytes_per_second as u64,
                        eta_secs = p.eta_secs,
                        "upload progress"
                    );
                }
            }
            RecordStatus::Upload(UploadStatus::Completed) => {
                tracing::info!(record, file = %file, "uploaded");
            }
            RecordStatus::Upload(UploadStatus::Failed) => {
                tracing::warn!(record, file = %file, error = message, "upload failed");
            }
            RecordStatus::Upload(UploadStatus::Canceled) => {
                tracing::info!(record, file = %file, "upload canceled");
            }
            RecordStatus::Verification(VerificationStatus::FailedLookup) => {
                tracing::warn!(record, file = %file, error = message, "verification failed");
            }
            status => tracing::trace!(record, file = %file, ?status, "status changed"),
        }
    }
}
