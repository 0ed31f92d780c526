//! `pie4k batch`: the end-to-end pipeline over a real archive — open the
//! key index, register the upscaler with the lifecycle bus, then for one
//! resource type run every resource through extract → upscale → assemble.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use pie4k_codec_api::{Codec, TwoDaCodec, WorkDirs};
use pie4k_registry::{Lifecycle, Service, ServiceRegistry, ServiceScope};
use pie4k_resources::ResourceReader;
use pie4k_scheduler::OperationsMonitor;
use pie4k_shared::config::Config;
use pie4k_upscale::UpscalerService;
use tracing::{info, warn};

#[derive(Args)]
pub struct BatchArgs {
    /// Path to the TOML config file.
    #[arg(long)]
    config: PathBuf,

    /// Path to the game's key/index file (e.g. chitin.key).
    #[arg(long)]
    key: PathBuf,

    /// Scratch directory for extract/upscaled/output intermediates.
    #[arg(long)]
    work_dir: PathBuf,
}

/// Forwards `Service` calls to a shared `UpscalerService` so the same
/// instance can be both registered with the lifecycle bus and called
/// directly by codecs that need it (image-backed resource types).
struct SharedUpscaler(Arc<UpscalerService>);

impl Service for SharedUpscaler {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn scope(&self) -> ServiceScope {
        self.0.scope()
    }

    fn on_lifecycle_event(&self, event: Lifecycle, context: &str) {
        self.0.on_lifecycle_event(event, context);
    }
}

pub fn execute(args: BatchArgs) -> Result<()> {
    let config = Config::load_toml(&args.config).context("loading config")?;
    let reader = ResourceReader::open(&args.key, &config.game_path, &config.game_type, &config.resource_known_bad, config.retain_cache)
        .context("opening key index")?;
    let operations = Arc::new(OperationsMonitor::new(config.max_cpu_pct, config.max_ram_pct, config.max_vram_pct));
    let upscaler = Arc::new(UpscalerService::new(&config, Arc::clone(&operations)));
    let scale = config.upscale_factor().value();

    let registry = ServiceRegistry::new();
    registry.register(Box::new(SharedUpscaler(Arc::clone(&upscaler))));

    let dirs = WorkDirs::new(&args.work_dir);
    let codec = TwoDaCodec::new();
    let type_code = codec.resource_type();

    registry.broadcast(Lifecycle::BatchUpscaleStart, "");
    registry.broadcast(Lifecycle::ResourceTypeStart, &format!("{type_code:#06x}"));

    let names = reader.names_for_type(type_code);
    info!(count = names.len(), type_code = format!("{type_code:#06x}"), "extracting resources");

    let mut extracted = Vec::with_capacity(names.len());
    for name in &names {
        match codec.extract(&reader, name, &dirs) {
            Ok(_) => extracted.push(name.clone()),
            Err(e) => warn!(name, error = %e, "extract failed, skipping"),
        }
    }

    codec.upscale(&dirs, &operations, &upscaler, scale).context("upscaling extracted resources")?;

    let mut assembled = 0u32;
    for name in &extracted {
        match codec.assemble(name, &dirs) {
            Ok(_) => assembled += 1,
            Err(e) => warn!(name, error = %e, "assemble failed"),
        }
    }

    registry.broadcast(Lifecycle::ResourceTypeEnd, &format!("{type_code:#06x}"));
    registry.broadcast(Lifecycle::BatchUpscaleEnd, "");

    reader.cleanup();
    info!(assembled, total = names.len(), "batch finished");
    Ok(())
}
