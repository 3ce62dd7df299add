//! Status command implementation.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use depthproof_core::AttestationStatus;
use tracing::warn;

use crate::utils::{format_time, Workspace};

/// Execute the status command.
pub async fn execute(data_dir: &Path, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(data_dir)?;
    let controller = workspace.attestation()?;
    if let Err(e) = controller.restore().await {
        warn!(error = %e, "Device key unavailable");
    }
    let session = controller.session();

    let queue = workspace.queue(None).await?;
    let stats = queue.stats().await;
    let next_retry = queue.next_retry_at().await;

    if quiet {
        return Ok(());
    }

    let attestation = match session.status {
        AttestationStatus::Attested => "attested".green(),
        AttestationStatus::Failed => "failed".red(),
        _ => "not attested".yellow(),
    };
    println!("{}", "Device".bold());
    println!("   {} {}", "Data dir:".dimmed(), data_dir.display());
    println!("   {} {}", "Backend:".dimmed(), workspace.config().api_url);
    println!(
        "   {} {}",
        "Key:".dimmed(),
        session.key_id.as_deref().unwrap_or("-")
    );
    println!("   {} {}", "Attestation:".dimmed(), attestation);
    if let Some(device_id) = &session.device_id {
        println!("   {} {}", "Device id:".dimmed(), device_id);
    }

    println!("{}", "Upload queue".bold());
    println!("   {} {}", "Pending:".dimmed(), stats.pending);
    println!("   {} {}", "Uploading:".dimmed(), stats.uploading);
    println!("   {} {}", "Processing:".dimmed(), stats.processing);
    println!("   {} {}", "Completed:".dimmed(), stats.completed);
    println!("   {} {}", "Failed:".dimmed(), stats.failed);
    println!(
        "   {} {}",
        "Permanently failed:".dimmed(),
        stats.permanently_failed
    );
    if next_retry.is_some() {
        println!("   {} {}", "Next retry:".dimmed(), format_time(next_retry));
    }
    Ok(())
}
