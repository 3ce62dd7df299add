//! Queue management commands.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use depthproof_core::{QueuedCapture, UploadStatus};
use uuid::Uuid;

use crate::utils::{format_time, Workspace};

fn colored_status(status: UploadStatus) -> colored::ColoredString {
    let label = status.as_str();
    match status {
        UploadStatus::Completed => label.green(),
        UploadStatus::Failed => label.yellow(),
        UploadStatus::PermanentlyFailed => label.red(),
        UploadStatus::Uploading | UploadStatus::Processing => label.cyan(),
        UploadStatus::Pending => label.normal(),
    }
}

fn print_item(item: &QueuedCapture) {
    let verified = if item.capture.assertion().is_some() {
        "verified".green()
    } else {
        "unverified".yellow()
    };
    println!(
        "{}  {:<18}  {:<10}  retries {}  queued {}",
        item.id(),
        colored_status(item.status),
        verified,
        item.retry_count,
        format_time(Some(item.queued_at)),
    );
    if let Some(at) = item.next_attempt_at {
        println!("    {} {}", "next attempt:".dimmed(), format_time(Some(at)));
    }
    if let Some(error) = &item.last_error {
        println!("    {} {}", "last error:".dimmed(), error);
    }
    if let Some(receipt) = &item.receipt {
        println!("    {} {}", "verify:".dimmed(), receipt.verification_url);
    }
}

/// List queued captures.
pub async fn list(data_dir: &Path, quiet: bool) -> Result<()> {
    let queue = Workspace::open(data_dir)?.queue(None).await?;
    let items = queue.snapshot().await;

    if quiet {
        return Ok(());
    }
    if items.is_empty() {
        println!("Upload queue is empty");
        return Ok(());
    }
    for item in &items {
        print_item(item);
    }
    Ok(())
}

/// Retry one failed capture, or all of them.
pub async fn retry(data_dir: &Path, id: Option<Uuid>, quiet: bool) -> Result<()> {
    let queue = Workspace::open(data_dir)?.queue(None).await?;
    let count = match id {
        Some(id) => {
            queue.retry(id).await?;
            1
        }
        None => queue.retry_all_failed().await?,
    };

    if !quiet {
        println!("Scheduled {count} capture(s) for retry");
    }
    Ok(())
}

/// Remove a capture and its cached photo.
pub async fn remove(data_dir: &Path, id: Uuid, quiet: bool) -> Result<()> {
    let queue = Workspace::open(data_dir)?.queue(None).await?;
    let removed = queue.remove(id).await?;

    if let Err(e) = tokio::fs::remove_file(removed.capture.photo_path()).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, "Failed to delete cached photo");
        }
    }
    if !quiet {
        println!("Removed {id} ({})", removed.status);
    }
    Ok(())
}

/// Drop completed (or permanently failed) captures.
pub async fn clear(data_dir: &Path, failed: bool, quiet: bool) -> Result<()> {
    let queue = Workspace::open(data_dir)?.queue(None).await?;
    let (count, label) = if failed {
        (queue.clear_permanently_failed().await?, "permanently failed")
    } else {
        (queue.clear_completed().await?, "completed")
    };

    if !quiet {
        println!("Removed {count} {label} capture(s)");
    }
    Ok(())
}
