//! The upscaler service facade (§4.I): owns the active model and its
//! allocator, measures VRAM to size tiles, submits per-image work through
//! the scheduler, and reacts to pipeline lifecycle events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::imageops::FilterType;
use image::DynamicImage;
use pie4k_registry::{Lifecycle, Service, ServiceScope};
use pie4k_scheduler::{AccessMode, Domain, OperationsMonitor, Priority, TaskRequirements};
use pie4k_shared::config::{Config, ModelVramInfo};
use pie4k_shared::error::{Pie4kError, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::allocator::TrackingAllocator;
use crate::engine::UpscaleEngine;
use crate::model::{load_model, Backend, SuperResolutionModel};
use crate::tile_budget::compute_optimal_tile_size;
use crate::vram_table::{table_with_overrides, DEFAULT_MODEL_VRAM_INFO};

/// Blend overlap in input pixels between adjacent tiles (§4.H); not
/// presently exposed as a config knob.
const DEFAULT_OVERLAP: u32 = 32;

/// A frame this small produces degenerate tile math; scale it with a
/// plain nearest-neighbor resize instead of running it through the model
/// (§4.I "tiny-frame short-circuit").
const TINY_FRAME_DIM: u32 = 4;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

struct ActiveModel {
    model: Arc<dyn SuperResolutionModel>,
    backend: Backend,
    model_name: String,
    type_code: Option<u16>,
    tile_size: u32,
    allocator: Arc<TrackingAllocator>,
}

/// Summary of one [`UpscalerService::process_directory`] run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub succeeded: u32,
    pub failed: u32,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

pub struct UpscalerService {
    operations: Arc<OperationsMonitor>,
    model_dir: PathBuf,
    max_vram_pct: f64,
    vram_table: HashMap<String, ModelVramInfo>,
    model_for_type: HashMap<u16, String>,
    default_model: Option<String>,
    state: Mutex<Option<ActiveModel>>,
}

impl UpscalerService {
    pub fn new(config: &Config, operations: Arc<OperationsMonitor>) -> Self {
        UpscalerService {
            operations,
            model_dir: config.model_dir.clone(),
            max_vram_pct: config.max_vram_pct,
            vram_table: table_with_overrides(&config.model_vram),
            model_for_type: config.upscaler_model_overrides.clone(),
            default_model: config.upscaler_model.clone(),
            state: Mutex::new(None),
        }
    }

    fn model_name_for(&self, type_code: u16) -> Option<&str> {
        self.model_for_type
            .get(&type_code)
            .map(String::as_str)
            .or(self.default_model.as_deref())
    }

    fn vram_info_for(&self, name: &str) -> ModelVramInfo {
        self.vram_table.get(name).copied().unwrap_or(DEFAULT_MODEL_VRAM_INFO)
    }

    /// Load the model for `type_code` (§4.I steps 1-6): select by
    /// resource-type, load GPU-then-CPU, measure the VRAM delta, and size
    /// tiles against the post-load headroom.
    pub fn activate_model_for_type(&self, type_code: u16, scale: u32) -> Result<()> {
        let name = self
            .model_name_for(type_code)
            .ok_or_else(|| Pie4kError::Configuration(format!("no upscaler model configured for type {type_code:#06x}")))?
            .to_string();

        {
            let guard = self.state.lock().expect("upscaler state mutex poisoned");
            if let Some(active) = guard.as_ref() {
                if active.type_code == Some(type_code) && active.model_name == name {
                    return Ok(());
                }
            }
        }

        let monitor = self.operations.monitor.clone();
        let before = monitor.refresh();
        let baseline_used_vram = before.used_vram;
        if before.total_vram == 0 {
            return Err(Pie4kError::VramMeasurement("no GPU telemetry available, total VRAM reads zero".into()));
        }

        let gpu_available = !self.no_gpu_telemetry_available();
        let loaded = load_model(&self.model_dir, &name, scale, gpu_available)?;

        if loaded.backend == Backend::Gpu {
            let after = monitor.refresh();
            if after.used_vram <= baseline_used_vram {
                return Err(Pie4kError::VramMeasurement(format!(
                    "loading model '{name}' produced no measurable VRAM delta ({baseline_used_vram} -> {})",
                    after.used_vram
                )));
            }
        }

        let after = monitor.current();
        let info = self.vram_info_for(&name);
        let recommendation = compute_optimal_tile_size(info, after.total_vram, after.used_vram, self.max_vram_pct, scale);
        if !recommendation.is_safe {
            warn!(model = %name, tile_size = recommendation.tile_size, "tile sizing reports zero safe concurrency, proceeding serially");
        }
        info!(model = %name, tile_size = recommendation.tile_size, max_concurrent = recommendation.max_concurrent, backend = ?loaded.backend, "model activated");

        let active = ActiveModel {
            model: Arc::from(loaded.model),
            backend: loaded.backend,
            model_name: name,
            type_code: Some(type_code),
            tile_size: recommendation.tile_size,
            allocator: Arc::new(TrackingAllocator::new()),
        };
        *self.state.lock().expect("upscaler state mutex poisoned") = Some(active);
        Ok(())
    }

    fn no_gpu_telemetry_available(&self) -> bool {
        // GPU selection itself (picking among `usable_gpu_ids`) is a
        // single-adapter concern the telemetry layer doesn't yet expose
        // per-index; availability is read off whether any telemetry
        // provider produced a non-zero VRAM total.
        self.operations.monitor.current().total_vram == 0 && self.operations.monitor.refresh().total_vram == 0
    }

    /// Upscale every supported image file under `input_dir`, writing
    /// `<stem>_upscaled.<ext>` into `output_dir` (§4.I batch processing).
    pub fn process_directory(&self, input_dir: &Path, output_dir: &Path, type_code: u16, scale: u32) -> Result<BatchOutcome> {
        self.activate_model_for_type(type_code, scale)?;
        std::fs::create_dir_all(output_dir).map_err(|e| Pie4kError::io(output_dir.to_path_buf(), e))?;

        let files = list_image_files(input_dir);
        let mut succeeded = 0u32;
        let mut failed = 0u32;

        for path in files {
            match self.process_one_file(&path, output_dir, scale) {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "upscale task failed");
                    failed += 1;
                }
            }
        }

        Ok(BatchOutcome { succeeded, failed })
    }

    fn process_one_file(&self, path: &Path, output_dir: &Path, scale: u32) -> Result<()> {
        let image = image::open(path).map_err(|e| Pie4kError::Upscale(format!("{}: {e}", path.display())))?;
        let (width, height) = (image.width(), image.height());
        let output_path = output_path_for(path, output_dir);

        if width <= TINY_FRAME_DIM && height <= TINY_FRAME_DIM {
            let resized = image.resize_exact(width * scale, height * scale, FilterType::Nearest);
            resized.save(&output_path).map_err(|e| Pie4kError::Upscale(e.to_string()))?;
            return Ok(());
        }

        let (tile_size, est_vram_bytes, domain, model, allocator) = {
            let guard = self.state.lock().expect("upscaler state mutex poisoned");
            let active = guard.as_ref().ok_or_else(|| Pie4kError::Configuration("no model activated".into()))?;
            let est_vram = self
                .operations
                .estimate_vram_for_operation(width.min(active.tile_size), height.min(active.tile_size), scale);
            let domain = if active.backend == Backend::Gpu { Domain::Gpu } else { Domain::Cpu };
            (active.tile_size, est_vram, domain, Arc::clone(&active.model), Arc::clone(&active.allocator))
        };

        let requirements = TaskRequirements {
            est_ram_bytes: self.operations.estimate_memory_for_file_size(path.metadata().map(|m| m.len()).unwrap_or(0)),
            est_vram_bytes,
            est_disk_io_bytes: 0,
            est_cpu_cores: self.operations.estimate_cpu_cores_for_operation("upscale"),
            starting_thread_count: 1,
            priority: Priority::Normal,
            access: AccessMode::Reserved,
            domain,
            operation_type: "upscale".to_string(),
            resource_name: path.file_name().and_then(|n| n.to_str()).map(String::from),
            blocking: true,
            save_profile: true,
            has_children: false,
        };

        let raw = to_bgr_bytes(&image);
        let channels = if has_alpha(&image) { 4 } else { 3 };
        let tile_size_for_task = tile_size;
        let output_path_for_task = output_path.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        self.operations.submit_task(requirements, move || {
            let result = run_upscale(
                model.as_ref(),
                allocator.as_ref(),
                &raw,
                width,
                height,
                channels,
                tile_size_for_task,
                &output_path_for_task,
            );
            let outcome = result.map_err(|e| e.to_string());
            let _ = tx.send(outcome.clone());
            outcome
        });

        rx.recv().map_err(|_| Pie4kError::Upscale("upscale task never reported back".into()))?.map_err(Pie4kError::Upscale)
    }
}

impl Service for UpscalerService {
    fn name(&self) -> &'static str {
        "upscaler"
    }

    fn scope(&self) -> ServiceScope {
        ServiceScope::ResourceTypeScoped
    }

    fn on_lifecycle_event(&self, event: Lifecycle, context: &str) {
        let mut guard = self.state.lock().expect("upscaler state mutex poisoned");
        match event {
            Lifecycle::BatchUpscaleEnd => {
                if let Some(active) = guard.take() {
                    active.allocator.force_cleanup();
                    active.allocator.wait_for_cleanup();
                }
            }
            Lifecycle::ResourceTypeStart => {
                let Ok(type_code) = context.trim_start_matches("0x").parse::<u16>() else {
                    return;
                };
                let reload_needed = match guard.as_ref() {
                    Some(active) => active.type_code != Some(type_code),
                    None => true,
                };
                if reload_needed {
                    guard.take();
                }
            }
            Lifecycle::ResourceTypeEnd => {
                if let Some(active) = guard.as_ref() {
                    active.allocator.force_cleanup();
                    active.allocator.wait_for_cleanup();
                }
            }
            Lifecycle::BatchUpscaleStart => {}
        }
    }
}

fn list_image_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

fn output_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let ext = input.extension().and_then(|s| s.to_str()).unwrap_or("png");
    output_dir.join(format!("{stem}_upscaled.{ext}"))
}

fn has_alpha(image: &DynamicImage) -> bool {
    image.color().has_alpha()
}

fn to_bgr_bytes(image: &DynamicImage) -> Vec<u8> {
    if has_alpha(image) {
        let rgba = image.to_rgba8();
        rgba.pixels().flat_map(|p| [p[2], p[1], p[0], p[3]]).collect()
    } else {
        let rgb = image.to_rgb8();
        rgb.pixels().flat_map(|p| [p[2], p[1], p[0]]).collect()
    }
}

fn run_upscale(
    model: &dyn SuperResolutionModel,
    allocator: &TrackingAllocator,
    bgr_or_bgra: &[u8],
    width: u32,
    height: u32,
    channels: u32,
    tile_size: u32,
    output_path: &Path,
) -> Result<()> {
    let engine = UpscaleEngine::with_allocator(model, tile_size, DEFAULT_OVERLAP, allocator);
    let (out, out_w, out_h) = engine.upscale(bgr_or_bgra, width, height, channels)?;

    let saved = if channels == 4 {
        let rgba: Vec<u8> = out.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0], p[3]]).collect();
        image::RgbaImage::from_raw(out_w, out_h, rgba)
            .ok_or_else(|| Pie4kError::Upscale("upscaled buffer size mismatch".into()))?
            .save(output_path)
    } else {
        let rgb: Vec<u8> = out.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect();
        image::RgbImage::from_raw(out_w, out_h, rgb)
            .ok_or_else(|| Pie4kError::Upscale("upscaled buffer size mismatch".into()))?
            .save(output_path)
    };
    saved.map_err(|e| Pie4kError::Upscale(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pie4k_scheduler::OperationsMonitor;
    use std::collections::HashMap as StdHashMap;

    fn test_config(dir: &Path) -> Config {
        Config {
            upscale_factor: pie4k_shared::config::UpscaleFactorRaw(4),
            game_type: "bg2".into(),
            game_path: PathBuf::from("/games/bg2"),
            max_cpu_pct: 80.0,
            max_ram_pct: 80.0,
            max_gpu_pct: 80.0,
            max_vram_pct: 90.0,
            usable_gpu_ids: vec![0],
            retain_cache: false,
            upscaler_model: Some("demo".into()),
            upscaler_model_overrides: StdHashMap::new(),
            model_dir: dir.to_path_buf(),
            resource_known_bad: Vec::new(),
            model_vram: StdHashMap::new(),
        }
    }

    #[test]
    fn activation_fails_cleanly_without_gpu_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo.param"), b"dummy").unwrap();
        std::fs::write(dir.path().join("demo.bin"), b"dummy").unwrap();
        let config = test_config(dir.path());
        let operations = Arc::new(OperationsMonitor::new(95.0, 95.0, 95.0));
        let service = UpscalerService::new(&config, operations);
        // Sandboxed CI has no GPU telemetry provider, so total_vram reads
        // zero and activation must report VramMeasurement, not panic.
        let result = service.activate_model_for_type(0x03f1, 4);
        assert!(matches!(result, Err(Pie4kError::VramMeasurement(_))));
    }

    #[test]
    fn missing_model_mapping_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.upscaler_model = None;
        let operations = Arc::new(OperationsMonitor::new(95.0, 95.0, 95.0));
        let service = UpscalerService::new(&config, operations);
        let result = service.activate_model_for_type(0x03f1, 4);
        assert!(matches!(result, Err(Pie4kError::Configuration(_))));
    }
}
