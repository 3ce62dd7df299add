//! Seal command implementation.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use depthproof_core::{
    AssertionBinder, CaptureLocation, CaptureProcessor, CapturedPhoto, DepthFrame, RawCapture,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::utils::{modified_ms, Workspace};

/// Bytes per depth sample (little-endian f32 meters).
const DEPTH_SAMPLE_BYTES: usize = 4;

#[derive(Args)]
pub struct SealArgs {
    /// Path to the photo (JPEG)
    #[arg(value_name = "PHOTO")]
    pub photo: PathBuf,

    /// Raw depth map: little-endian f32 samples, row-major
    #[arg(long, value_name = "FILE")]
    pub depth: PathBuf,

    /// Depth map width in samples
    #[arg(long)]
    pub depth_width: u32,

    /// Depth map height in samples
    #[arg(long)]
    pub depth_height: u32,

    /// When the depth frame was captured, epoch milliseconds
    #[arg(long)]
    pub depth_timestamp_ms: i64,

    /// When the photo was captured, epoch milliseconds (default: file mtime)
    #[arg(long)]
    pub photo_timestamp_ms: Option<i64>,

    /// Photo width in pixels
    #[arg(long, default_value_t = 0)]
    pub photo_width: u32,

    /// Photo height in pixels
    #[arg(long, default_value_t = 0)]
    pub photo_height: u32,

    /// Latitude of the capture location
    #[arg(long, requires = "longitude", allow_negative_numbers = true)]
    pub latitude: Option<f64>,

    /// Longitude of the capture location
    #[arg(long, requires = "latitude", allow_negative_numbers = true)]
    pub longitude: Option<f64>,

    /// On-device detection results (JSON) to upload alongside the capture
    #[arg(long, value_name = "FILE")]
    pub detection: Option<PathBuf>,
}

fn read_depth_frame(args: &SealArgs) -> Result<DepthFrame> {
    let depth_map = std::fs::read(&args.depth)
        .with_context(|| format!("Failed to read depth file: {}", args.depth.display()))?;

    let expected =
        args.depth_width as usize * args.depth_height as usize * DEPTH_SAMPLE_BYTES;
    if depth_map.len() != expected {
        bail!(
            "Depth file size {} does not match {}x{} f32 samples ({} bytes)",
            depth_map.len(),
            args.depth_width,
            args.depth_height,
            expected
        );
    }

    Ok(DepthFrame {
        width: args.depth_width,
        height: args.depth_height,
        timestamp_ms: args.depth_timestamp_ms,
        depth_map,
    })
}

fn read_detection(path: &Path) -> Result<serde_json::Value> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read detection file: {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("Detection file is not valid JSON: {}", path.display()))
}

/// Execute the seal command.
pub async fn execute(args: SealArgs, data_dir: &Path, quiet: bool) -> Result<()> {
    if !args.photo.is_file() {
        bail!("Failed to read photo: {}", args.photo.display());
    }
    let depth_frame = read_depth_frame(&args)?;
    let detection = args.detection.as_deref().map(read_detection).transpose()?;
    let photo_timestamp_ms = match args.photo_timestamp_ms {
        Some(ms) => ms,
        None => modified_ms(&args.photo)?,
    };

    let workspace = Workspace::open(data_dir)?;
    let extension = args
        .photo
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    let cached_photo = workspace
        .captures_dir()
        .join(format!("{}.{extension}", Uuid::new_v4()));

    let location = args
        .latitude
        .zip(args.longitude)
        .map(|(latitude, longitude)| CaptureLocation {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
            timestamp_ms: Utc::now().timestamp_millis(),
            geohash: None,
        });

    let raw = RawCapture::assemble(
        CapturedPhoto {
            path: cached_photo.clone(),
            width: args.photo_width,
            height: args.photo_height,
            exif: None,
        },
        depth_frame,
        photo_timestamp_ms,
        location,
        workspace.config().sync_window_ms,
    )
    .context("Capture rejected")?;

    // The queue owns its copy; the original is never deleted.
    tokio::fs::copy(&args.photo, &cached_photo)
        .await
        .with_context(|| format!("Failed to write photo cache: {}", cached_photo.display()))?;

    let controller = workspace.attestation()?;
    let attested = match controller.restore().await {
        Ok(attested) => attested,
        Err(e) => {
            warn!(error = %e, "Device key unavailable, sealing unverified");
            false
        }
    };
    let binder = AssertionBinder::new(
        controller,
        workspace.provider(),
        workspace.config().attestation_timeout,
    );

    let prepared = CaptureProcessor::new(workspace.config())
        .prepare(&raw)
        .await
        .context("Failed to process capture")?;
    let assertion = binder.bind(prepared.metadata()).await;
    let mut capture = prepared.finish(assertion);
    if let Some(detection) = detection {
        capture = capture.with_detection(detection);
    }

    let queue = workspace.queue(None).await?;
    queue
        .enqueue(capture.clone())
        .await
        .context("Failed to queue capture")?;

    info!(
        capture_id = %capture.id(),
        verified = capture.assertion().is_some(),
        sync_delta_ms = raw.sync_delta_ms(),
        "Capture sealed"
    );

    if !quiet {
        println!("{}", "Capture sealed".green().bold());
        println!("   {} {}", "Id:".dimmed(), capture.id());
        println!("   {} {}", "Photo hash:".dimmed(), capture.photo_hash());
        println!("   {} {}ms", "Sync delta:".dimmed(), raw.sync_delta_ms());
        if capture.assertion().is_some() {
            println!("   {} {}", "Assertion:".dimmed(), "signed".green());
        } else if attested {
            println!("   {} {}", "Assertion:".dimmed(), "signing failed".yellow());
        } else {
            println!(
                "   {} {}",
                "Assertion:".dimmed(),
                "unverified (run `depthproof attest`)".yellow()
            );
        }
        println!("   {} {}", "Status:".dimmed(), "pending upload".cyan());
    }
    Ok(())
}
