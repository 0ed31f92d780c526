//! `pie4k upscale-dir`: run the upscaler service directly over a
//! directory of already-extracted images, bypassing the archive layer.
//! Useful for testing model/tile behavior without a game install on hand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use pie4k_scheduler::OperationsMonitor;
use pie4k_shared::config::Config;
use pie4k_upscale::UpscalerService;

#[derive(Args)]
pub struct UpscaleDirArgs {
    /// Directory of images to upscale.
    #[arg(long)]
    input: PathBuf,

    /// Directory to write upscaled images into.
    #[arg(long)]
    output: PathBuf,

    /// Resource type code the images belong to (hex, e.g. 0x3f4), used to
    /// select which model to load.
    #[arg(long, value_parser = parse_hex_u16)]
    type_code: u16,

    /// Path to the TOML config file.
    #[arg(long)]
    config: PathBuf,
}

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
}

pub fn execute(args: UpscaleDirArgs) -> Result<()> {
    let config = Config::load_toml(&args.config).context("loading config")?;
    let operations = Arc::new(OperationsMonitor::new(config.max_cpu_pct, config.max_ram_pct, config.max_vram_pct));
    let upscaler = UpscalerService::new(&config, Arc::clone(&operations));

    let scale = config.upscale_factor().value();
    let outcome = upscaler.process_directory(&args.input, &args.output, args.type_code, scale)?;

    tracing::info!(succeeded = outcome.succeeded, failed = outcome.failed, "upscale-dir finished");
    if !outcome.all_succeeded() {
        bail!("{} of {} files failed to upscale", outcome.failed, outcome.succeeded + outcome.failed);
    }
    Ok(())
}
