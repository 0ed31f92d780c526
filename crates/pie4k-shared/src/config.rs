//! Pipeline configuration (§6 config knobs).
//!
//! Primary format is TOML, loaded from the platform config directory via
//! `directories`, following the same `#[serde(default = "...")]` per
//! field pattern the rest of the corpus uses for its app configs. A flat
//! `key=value` loader is kept alongside it for compatibility with the
//! original tool's `.ini`-style config files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Pie4kError, Result};

/// One of the six upscale factors the engine supports. Any other value
/// read from config resets to `Four` with a warning (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpscaleFactor {
    One = 1,
    Two = 2,
    Four = 4,
    Six = 6,
    Eight = 8,
    Twelve = 12,
}

impl UpscaleFactor {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => UpscaleFactor::One,
            2 => UpscaleFactor::Two,
            4 => UpscaleFactor::Four,
            6 => UpscaleFactor::Six,
            8 => UpscaleFactor::Eight,
            12 => UpscaleFactor::Twelve,
            other => {
                tracing::warn!(value = other, "invalid UpScaleFactor, resetting to 4");
                UpscaleFactor::Four
            }
        }
    }

    pub fn value(self) -> u32 {
        self as u32
    }
}

impl Default for UpscaleFactor {
    fn default() -> Self {
        UpscaleFactor::Four
    }
}

fn default_max_pct() -> f64 {
    80.0
}

fn default_max_vram_pct() -> f64 {
    90.0
}

fn default_usable_gpu_ids() -> Vec<u32> {
    vec![0]
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

/// Per-model VRAM forecast override, mirrored from `ModelVramInfo` in the
/// original source's `UpscalerService.h`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelVramInfo {
    pub load_mb: u32,
    pub inference_512_mb: u32,
    pub overhead_mb: u32,
}

/// Full pipeline configuration, as read from `pie4k.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upscale_factor: UpscaleFactorRaw,

    pub game_type: String,
    pub game_path: PathBuf,

    #[serde(default = "default_max_pct")]
    pub max_cpu_pct: f64,
    #[serde(default = "default_max_pct")]
    pub max_ram_pct: f64,
    #[serde(default = "default_max_pct")]
    pub max_gpu_pct: f64,
    #[serde(default = "default_max_vram_pct")]
    pub max_vram_pct: f64,

    #[serde(default = "default_usable_gpu_ids")]
    pub usable_gpu_ids: Vec<u32>,

    #[serde(default)]
    pub retain_cache: bool,

    #[serde(default)]
    pub upscaler_model: Option<String>,
    /// Per resource-type-code model name override.
    #[serde(default)]
    pub upscaler_model_overrides: HashMap<u16, String>,
    /// Directory holding `<name>.param`/`<name>.bin` model pairs, mirrors
    /// the original tool's `NCNNModelPath` knob.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default)]
    pub resource_known_bad: Vec<String>,

    #[serde(default)]
    pub model_vram: HashMap<String, ModelVramInfo>,
}

/// Raw wrapper so `#[serde(default)]` can validate the numeric value
/// through [`UpscaleFactor::from_raw`] rather than rejecting the whole
/// document on a bad enum value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UpscaleFactorRaw(pub u32);

impl Config {
    pub fn game_override_path(&self) -> PathBuf {
        self.game_path.join("override")
    }

    pub fn upscale_factor(&self) -> UpscaleFactor {
        if self.upscale_factor.0 == 0 {
            UpscaleFactor::default()
        } else {
            UpscaleFactor::from_raw(self.upscale_factor.0)
        }
    }

    pub fn model_for_type(&self, type_code: u16) -> Option<&str> {
        self.upscaler_model_overrides
            .get(&type_code)
            .map(String::as_str)
            .or(self.upscaler_model.as_deref())
    }

    /// Load from a TOML file.
    pub fn load_toml(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| Pie4kError::io(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| Pie4kError::Configuration(e.to_string()))
    }

    /// Load from the platform-default config directory
    /// (`<config_dir>/pie4k/pie4k.toml`), following `directories`'
    /// `ProjectDirs` convention used throughout the corpus.
    pub fn load_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("dev", "pie4k", "pie4k")
            .ok_or_else(|| Pie4kError::Configuration("no home directory".into()))?;
        Self::load_toml(&dirs.config_dir().join("pie4k.toml"))
    }

    /// Parse the original tool's flat `key=value` config format (one pair
    /// per line, `#` starts a comment). Values not recognized from §6 are
    /// ignored; this exists purely for drop-in compatibility with
    /// existing mod configs, not as the primary format.
    pub fn from_ini_str(text: &str, game_path: PathBuf) -> Result<Self> {
        let mut raw_pairs: HashMap<String, String> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                raw_pairs.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let mut cfg = Config {
            upscale_factor: UpscaleFactorRaw(
                raw_pairs
                    .get("UpScaleFactor")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(4),
            ),
            game_type: raw_pairs
                .get("GameType")
                .cloned()
                .ok_or_else(|| Pie4kError::Configuration("missing GameType".into()))?,
            game_path,
            max_cpu_pct: default_max_pct(),
            max_ram_pct: default_max_pct(),
            max_gpu_pct: default_max_pct(),
            max_vram_pct: default_max_vram_pct(),
            usable_gpu_ids: default_usable_gpu_ids(),
            retain_cache: raw_pairs
                .get("RetainCache")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            upscaler_model: raw_pairs.get("UpscalerModel").cloned(),
            upscaler_model_overrides: HashMap::new(),
            model_dir: raw_pairs
                .get("NCNNModelPath")
                .map(PathBuf::from)
                .unwrap_or_else(default_model_dir),
            resource_known_bad: Vec::new(),
            model_vram: HashMap::new(),
        };

        if let Some(v) = raw_pairs.get("MaxCPU").and_then(|v| v.parse().ok()) {
            cfg.max_cpu_pct = v;
        }
        if let Some(v) = raw_pairs.get("MaxRAM").and_then(|v| v.parse().ok()) {
            cfg.max_ram_pct = v;
        }
        if let Some(v) = raw_pairs.get("MaxGPU").and_then(|v| v.parse().ok()) {
            cfg.max_gpu_pct = v;
        }
        if let Some(v) = raw_pairs.get("MaxVRAM").and_then(|v| v.parse().ok()) {
            cfg.max_vram_pct = v;
        }
        if let Some(ids) = raw_pairs.get("UsableGPUIDs") {
            let parsed: Vec<u32> = ids
                .split(',')
                .filter_map(|s| {
                    let s = s.trim();
                    match s.parse::<u32>() {
                        Ok(id) => Some(id),
                        Err(_) if !s.is_empty() => {
                            tracing::warn!(value = s, "invalid UsableGPUIDs entry, skipping");
                            None
                        }
                        Err(_) => None,
                    }
                })
                .collect();
            cfg.usable_gpu_ids = if parsed.is_empty() { vec![0] } else { parsed };
        }
        if let Some(bad) = raw_pairs.get("ResourceKnownBad") {
            cfg.resource_known_bad = bad
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_upscale_factor_resets_to_four() {
        assert_eq!(UpscaleFactor::from_raw(3), UpscaleFactor::Four);
        assert_eq!(UpscaleFactor::from_raw(7), UpscaleFactor::Four);
        assert_eq!(UpscaleFactor::from_raw(8), UpscaleFactor::Eight);
    }

    #[test]
    fn override_path_is_game_path_slash_override() {
        let cfg = Config {
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
            model_dir: default_model_dir(),
            resource_known_bad: Vec::new(),
            model_vram: HashMap::new(),
        };
        assert_eq!(cfg.game_override_path(), PathBuf::from("/games/bg2/override"));
    }

    #[test]
    fn ini_parses_usable_gpu_ids_and_skips_invalid() {
        let text = "GameType=bg2\nUsableGPUIDs=0, bogus, 2\n";
        let cfg = Config::from_ini_str(text, PathBuf::from("/games/bg2")).unwrap();
        assert_eq!(cfg.usable_gpu_ids, vec![0, 2]);
    }

    #[test]
    fn ini_empty_gpu_ids_defaults_to_zero() {
        let text = "GameType=bg2\nUsableGPUIDs=\n";
        let cfg = Config::from_ini_str(text, PathBuf::from("/games/bg2")).unwrap();
        assert_eq!(cfg.usable_gpu_ids, vec![0]);
    }

    #[test]
    fn ini_missing_game_type_errors() {
        let text = "UpScaleFactor=4\n";
        assert!(Config::from_ini_str(text, PathBuf::from("/games/bg2")).is_err());
    }
}
