//! DepthProof CLI - seal photo + depth captures and deliver them to the backend.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;
mod exit_codes;
mod utils;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0   Success
  1   General error
  64  Usage error (unknown capture, invalid state)
  65  Capture rejected (photo and depth out of sync, malformed depth data)
  66  Input file unreadable
  69  Backend unavailable
  74  Local storage error";

#[derive(Parser)]
#[command(name = "depthproof")]
#[command(author, version, about = "Trusted photo + depth capture sealing", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Directory holding device keys, cached photos and the upload queue
    #[arg(
        long,
        global = true,
        env = "DEPTHPROOF_DATA_DIR",
        default_value = ".depthproof"
    )]
    data_dir: PathBuf,

    /// Suppress human-readable output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attest this device's key with the backend and register the device
    Attest,

    /// Seal a photo and its depth frame and queue them for upload
    Seal(commands::seal::SealArgs),

    /// Upload queued captures
    Upload {
        /// Keep running and upload new captures as they are queued
        #[arg(long)]
        watch: bool,
    },

    /// Inspect and manage the upload queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show device key, attestation and queue status
    Status,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued captures
    List,

    /// Retry a failed capture, or every failed capture when no id is given
    Retry {
        #[arg(value_name = "ID")]
        id: Option<Uuid>,
    },

    /// Remove a capture from the queue
    Remove {
        #[arg(value_name = "ID")]
        id: Uuid,
    },

    /// Drop completed captures
    Clear {
        /// Drop permanently failed captures instead
        #[arg(long)]
        failed: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("depthproof_core=warn,depthproof=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let quiet = cli.quiet;
    let data_dir = cli.data_dir;

    let result = match cli.command {
        Commands::Attest => commands::attest::execute(&data_dir, quiet).await,
        Commands::Seal(args) => commands::seal::execute(args, &data_dir, quiet).await,
        Commands::Upload { watch } => commands::upload::execute(&data_dir, watch, quiet).await,
        Commands::Queue { action } => match action {
            QueueAction::List => commands::queue::list(&data_dir, quiet).await,
            QueueAction::Retry { id } => commands::queue::retry(&data_dir, id, quiet).await,
            QueueAction::Remove { id } => commands::queue::remove(&data_dir, id, quiet).await,
            QueueAction::Clear { failed } => commands::queue::clear(&data_dir, failed, quiet).await,
        },
        Commands::Status => commands::status::execute(&data_dir, quiet).await,
    };

    if let Err(err) = result {
        let exit = ExitCode::from_anyhow(&err);
        if !quiet {
            if let Some(message) = &exit.message {
                eprintln!("{} {}", "Error:".red().bold(), message);
            }
        }
        std::process::exit(exit.code);
    }
}
