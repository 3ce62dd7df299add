//! Upload command implementation.

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;
use depthproof_core::{QueueEvent, UploadStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::utils::{format_time, Workspace};

/// Execute the upload command.
pub async fn execute(data_dir: &Path, watch: bool, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(data_dir)?;

    // Uploads carry the registered device id when the device is attested.
    let controller = workspace.attestation()?;
    let device_id = match controller.restore().await {
        Ok(true) => controller.session().device_id,
        Ok(false) => None,
        Err(e) => {
            warn!(error = %e, "Device key unavailable, uploading without device id");
            None
        }
    };
    let queue = workspace.queue(device_id).await?;

    let mut events = queue.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::StatusChanged { id, status }) if !quiet => {
                    let label = match status {
                        UploadStatus::Completed => status.as_str().green(),
                        UploadStatus::Failed => status.as_str().yellow(),
                        UploadStatus::PermanentlyFailed => status.as_str().red(),
                        _ => status.as_str().normal(),
                    };
                    println!("{id}  {label}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped queue events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if watch {
        info!("Watching upload queue");
        tokio::select! {
            _ = queue.run() => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping upload worker"),
        }
        reporter.abort();
        return Ok(());
    }

    let summary = queue.process().await;
    let next_retry = queue.next_retry_at().await;
    drop(queue);
    join_reporter(reporter).await;

    if !quiet {
        println!(
            "Uploaded {}, retry scheduled {}, permanently failed {}",
            summary.completed, summary.retry_scheduled, summary.permanently_failed
        );
        if next_retry.is_some() {
            println!("   {} {}", "Next retry:".dimmed(), format_time(next_retry));
        }
    }

    if summary.retry_scheduled > 0 && summary.completed == 0 {
        bail!(
            "backend unavailable, {} capture(s) will be retried",
            summary.retry_scheduled
        );
    }
    Ok(())
}

/// Wait for the progress reporter to drain. A reporter that panicked only
/// loses output, so it is logged rather than failing the upload.
async fn join_reporter(reporter: JoinHandle<()>) {
    if let Err(e) = reporter.await {
        warn!(error = %e, "Upload progress reporter stopped abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_reporter_tolerates_panicked_reporter() {
        let reporter = tokio::spawn(async { panic!("reporter failed") });
        join_reporter(reporter).await;
    }

    #[tokio::test]
    async fn test_join_reporter_waits_for_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let reporter = tokio::spawn(async move {
            let _ = tx.send(());
        });
        join_reporter(reporter).await;
        assert!(rx.await.is_ok());
    }
}
