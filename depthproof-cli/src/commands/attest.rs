//! Attest command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

use crate::utils::Workspace;

/// Execute the attest command.
pub async fn execute(data_dir: &Path, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(data_dir)?;
    let controller = workspace.attestation()?;

    controller
        .ensure_attested()
        .await
        .context("Attestation failed")?;

    let session = controller.session();
    info!(
        key_id = session.key_id.as_deref().unwrap_or_default(),
        device_id = session.device_id.as_deref().unwrap_or_default(),
        "Device attested"
    );

    if !quiet {
        println!("{}", "Device attested".green().bold());
        println!(
            "   {} {}",
            "Key:".dimmed(),
            session.key_id.as_deref().unwrap_or("-")
        );
        println!(
            "   {} {}",
            "Device:".dimmed(),
            session.device_id.as_deref().unwrap_or("-")
        );
        println!(
            "   {} {}",
            "Level:".dimmed(),
            session.attestation_level.as_deref().unwrap_or("-")
        );
        println!("   {} {}", "Backend:".dimmed(), workspace.config().api_url);
    }
    Ok(())
}
