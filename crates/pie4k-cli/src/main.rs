//! Command-line driver for the asset upscaling pipeline.
//!
//! # Commands
//!
//! - `pie4k batch` — open a game's key/index file and run every resource
//!   of one supported type through extract → upscale → assemble.
//! - `pie4k upscale-dir` — run the upscaler service directly over a
//!   directory of already-extracted images.

mod batch;
mod upscale_dir;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pie4k")]
#[command(about = "Upscale Infinity Engine game assets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full archive-backed pipeline for one resource type.
    Batch(batch::BatchArgs),

    /// Upscale a directory of images directly, without an archive.
    UpscaleDir(upscale_dir::UpscaleDirArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Batch(args) => batch::execute(args),
        Commands::UpscaleDir(args) => upscale_dir::execute(args),
    }
}
