//! A minimal 2DA codec (§4.K reference implementation, IESDP 2DA V1.0):
//! extracts the raw text table, scales a handful of known coordinate
//! columns by the upscale factor, and reassembles. Deliberately not a
//! complete 2DA implementation — only enough surface to exercise the
//! resource layer, scheduler, and upscaler service through one real
//! codec.

use std::path::PathBuf;

use pie4k_resources::ResourceReader;
use pie4k_scheduler::OperationsMonitor;
use pie4k_shared::error::{Pie4kError, Result};
use pie4k_upscale::UpscalerService;
use tracing::{debug, info, warn};

use crate::codec::{Codec, WorkDirs};
use crate::table::TwoDaTable;

/// IESDP resource type code for 2DA tables.
pub const TWO_DA_TYPE_CODE: u16 = 0x03f4;

/// First two bytes of an encrypted 2DA; such files are passed through
/// unmodified since their text cannot be parsed.
const ENCRYPTED_MARKER: [u8; 2] = [0xFF, 0xFF];

pub struct TwoDaCodec;

impl TwoDaCodec {
    pub fn new() -> Self {
        TwoDaCodec
    }
}

impl Default for TwoDaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for TwoDaCodec {
    fn resource_type(&self) -> u16 {
        TWO_DA_TYPE_CODE
    }

    fn extract(&self, reader: &ResourceReader, name: &str, dirs: &WorkDirs) -> Result<PathBuf> {
        let bytes = reader.read(name, self.resource_type())?;
        let extract_dir = dirs.extract_dir(self.resource_type());
        std::fs::create_dir_all(&extract_dir).map_err(|e| Pie4kError::io(extract_dir.clone(), e))?;
        let path = extract_dir.join(format!("{name}.2da"));
        std::fs::write(&path, &bytes).map_err(|e| Pie4kError::io(path.clone(), e))?;
        debug!(name, bytes = bytes.len(), "extracted 2DA");
        Ok(path)
    }

    fn upscale(&self, dirs: &WorkDirs, _operations: &OperationsMonitor, _upscaler: &UpscalerService, scale: u32) -> Result<()> {
        let extract_dir = dirs.extract_dir(self.resource_type());
        let upscaled_dir = dirs.upscaled_dir(self.resource_type());
        std::fs::create_dir_all(&upscaled_dir).map_err(|e| Pie4kError::io(upscaled_dir.clone(), e))?;

        let entries = std::fs::read_dir(&extract_dir).map_err(|e| Pie4kError::io(extract_dir.clone(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Pie4kError::io(extract_dir.clone(), e))?;
            let src_path = entry.path();
            if src_path.extension().and_then(|e| e.to_str()) != Some("2da") {
                continue;
            }
            let dst_path = upscaled_dir.join(entry.file_name());
            upscale_one(&src_path, &dst_path, scale)?;
        }
        Ok(())
    }

    fn assemble(&self, name: &str, dirs: &WorkDirs) -> Result<PathBuf> {
        let upscaled_path = dirs.upscaled_dir(self.resource_type()).join(format!("{name}.2da"));
        let output_dir = dirs.output_dir(self.resource_type());
        std::fs::create_dir_all(&output_dir).map_err(|e| Pie4kError::io(output_dir.clone(), e))?;
        let output_path = output_dir.join(format!("{name}.2da"));

        std::fs::copy(&upscaled_path, &output_path).map_err(|e| Pie4kError::io(upscaled_path.clone(), e))?;
        info!(name, "assembled 2DA");
        Ok(output_path)
    }
}

fn upscale_one(src_path: &std::path::Path, dst_path: &std::path::Path, scale: u32) -> Result<()> {
    let bytes = std::fs::read(src_path).map_err(|e| Pie4kError::io(src_path.to_path_buf(), e))?;
    if bytes.starts_with(&ENCRYPTED_MARKER) {
        warn!(path = %src_path.display(), "encrypted 2DA, passing through unmodified");
        std::fs::write(dst_path, &bytes).map_err(|e| Pie4kError::io(dst_path.to_path_buf(), e))?;
        return Ok(());
    }

    let text = String::from_utf8_lossy(&bytes);
    let Some(mut table) = TwoDaTable::load_from_text(&text) else {
        return Err(Pie4kError::Upscale(format!("failed to parse 2DA text: {}", src_path.display())));
    };

    table.scale_rows_by_prefixes(&["START_XPOS", "START_YPOS"], scale as i64);

    let file_stem = src_path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    if file_stem == "fonts" {
        if let Some(idx) = table.column_index("PX_SIZE") {
            let factor = (scale as f64).sqrt();
            table.scale_integer_column_by(idx, factor);
        }
    }
    if file_stem == "xnewarea" {
        if let Some(idx) = table.column_index("LOCX") {
            table.scale_integer_column_by(idx, scale as f64);
        }
        if let Some(idx) = table.column_index("LOCY") {
            table.scale_integer_column_by(idx, scale as f64);
        }
    }

    let out_text = table.serialize_to_text();
    std::fs::write(dst_path, out_text).map_err(|e| Pie4kError::io(dst_path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pie4k_scheduler::OperationsMonitor;
    use pie4k_shared::config::{Config, UpscaleFactorRaw};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_upscaler(dir: &std::path::Path) -> UpscalerService {
        let config = Config {
            upscale_factor: UpscaleFactorRaw(4),
            game_type: "bg2".into(),
            game_path: PathBuf::from("/games/bg2"),
            max_cpu_pct: 80.0,
            max_ram_pct: 80.0,
            max_gpu_pct: 80.0,
            max_vram_pct: 90.0,
            usable_gpu_ids: vec![0],
            retain_cache: false,
            upscaler_model: None,
            upscaler_model_overrides: HashMap::new(),
            model_dir: dir.to_path_buf(),
            resource_known_bad: Vec::new(),
            model_vram: HashMap::new(),
        };
        UpscalerService::new(&config, Arc::new(OperationsMonitor::new(80.0, 80.0, 90.0)))
    }

    #[test]
    fn upscale_scales_start_xpos_rows_and_leaves_others() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = WorkDirs::new(dir.path());
        let extract_dir = dirs.extract_dir(TWO_DA_TYPE_CODE);
        std::fs::create_dir_all(&extract_dir).unwrap();
        std::fs::write(
            extract_dir.join("weapprof.2da"),
            "2DA V1.0\n0\nNAME XPOS YPOS\nSTART_XPOS 100 200\nOTHER 5 6\n",
        )
        .unwrap();

        let codec = TwoDaCodec::new();
        let upscaler = test_upscaler(dir.path());
        let operations = OperationsMonitor::new(80.0, 80.0, 90.0);
        codec.upscale(&dirs, &operations, &upscaler, 4).unwrap();

        let out = std::fs::read_to_string(dirs.upscaled_dir(TWO_DA_TYPE_CODE).join("weapprof.2da")).unwrap();
        assert!(out.contains("START_XPOS\t400\t800"));
        assert!(out.contains("OTHER\t5\t6"));
    }

    #[test]
    fn encrypted_2da_is_passed_through_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = WorkDirs::new(dir.path());
        let extract_dir = dirs.extract_dir(TWO_DA_TYPE_CODE);
        std::fs::create_dir_all(&extract_dir).unwrap();
        let mut bytes = vec![0xFFu8, 0xFF, 1, 2, 3];
        std::fs::write(extract_dir.join("encrypted.2da"), &bytes).unwrap();
        bytes.clear();

        let codec = TwoDaCodec::new();
        let upscaler = test_upscaler(dir.path());
        let operations = OperationsMonitor::new(80.0, 80.0, 90.0);
        codec.upscale(&dirs, &operations, &upscaler, 4).unwrap();

        let out = std::fs::read(dirs.upscaled_dir(TWO_DA_TYPE_CODE).join("encrypted.2da")).unwrap();
        assert_eq!(out, vec![0xFF, 0xFF, 1, 2, 3]);
    }
}
