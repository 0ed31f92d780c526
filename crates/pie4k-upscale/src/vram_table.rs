//! Default per-model VRAM forecast table (§4.I `ModelVRAMInfo`), seeded
//! from the original service's `modelVramUsageMap` and overridable from
//! the `[model_vram]` config section (Open Question resolution #2).

use std::collections::HashMap;

use pie4k_shared::config::ModelVramInfo;

const ENTRIES: &[(&str, u32, u32, u32)] = &[
    ("upscayl-hfa2k", 364, 5314, 26),
    ("upscayl-lsdir-4x-compact-c3", 180, 256, 16),
    ("upscayl-lsdir-4x-plus-c", 364, 5314, 26),
    ("upscayl-lsdir", 364, 5314, 26),
    ("upscayl-nmkd-4x-siax-200k", 364, 5314, 26),
    ("upscayl-nmkd-4x-superscale-sd-178000-g", 364, 5314, 26),
    ("upscayl-nomos-4x-8k-sc", 364, 5314, 26),
    ("upscayl-realesrgan-x4-general-wdn-v3", 188, 256, 16),
    ("upscayl-realesrgan-x4plus-anime", 228, 5306, 18),
    ("upscayl-realesrgan-x4plus-v3", 188, 256, 16),
    ("upscayl-realesrgan-x4plus", 364, 5314, 26),
    ("upscayl-remacri", 364, 5314, 26),
    ("upscayl-ultramix_balanced", 364, 5314, 26),
    ("upscayl-ultrasharp-v2", 364, 5314, 26),
    ("upscayl-ultrasharp", 364, 5314, 26),
    ("upscayl-uniscale-restore", 364, 5314, 26),
    ("xintao-realesr-animevideo-x2-v3", 180, 256, 16),
    ("xintao-realesr-animevideo-x3-v3", 180, 256, 16),
    ("xintao-realesr-animevideo-x4-v3", 180, 256, 16),
    ("xintao-realesrgan-x4plus-anime", 228, 5306, 18),
    ("xintao-realesrgan-x4plus", 364, 5314, 26),
    ("digital-art-4x", 228, 5306, 18),
    ("high-fidelity-4x", 364, 5314, 26),
    ("remacri-4x", 364, 5314, 26),
    ("ultramix-balanced-4x", 364, 5314, 26),
    ("ultrasharp-4x", 364, 5314, 26),
    ("upscayl-lite-4x", 188, 256, 16),
    ("upscayl-standard-4x", 364, 5314, 26),
    ("unknown-2.0.1", 364, 5314, 26),
    ("uniscale_restore", 364, 5314, 26),
    ("RealESRGAN_General_x4_v3", 188, 256, 16),
    ("RealESRGAN_General_WDN_x4_v3", 188, 256, 16),
    ("realesr-animevideov3-x4", 180, 256, 16),
    ("realesr-animevideov3-x3", 180, 256, 16),
    ("realesr-animevideov3-x2", 180, 256, 16),
    ("4x_NMKD-Superscale-SP_178000_G", 364, 5314, 26),
    ("4x_NMKD-Siax_200k", 364, 5314, 26),
    ("4xNomos8kSC", 364, 5314, 26),
    ("4xLSDIRplusC", 364, 5314, 26),
    ("4xLSDIRCompactC3", 180, 256, 16),
    ("4xLSDIR", 364, 5314, 26),
    ("4xHFA2k", 364, 5314, 26),
];

/// The reference default used for any model name not present in the
/// table (§4.I "fall back to a reference default").
pub const DEFAULT_MODEL_VRAM_INFO: ModelVramInfo = ModelVramInfo {
    load_mb: 364,
    inference_512_mb: 5314,
    overhead_mb: 26,
};

pub fn default_table() -> HashMap<String, ModelVramInfo> {
    ENTRIES
        .iter()
        .map(|&(name, load_mb, inference_512_mb, overhead_mb)| {
            (name.to_string(), ModelVramInfo { load_mb, inference_512_mb, overhead_mb })
        })
        .collect()
}

/// Merge `overrides` (from config's `[model_vram]` section) over the
/// built-in defaults, overrides winning on name collision.
pub fn table_with_overrides(overrides: &HashMap<String, ModelVramInfo>) -> HashMap<String, ModelVramInfo> {
    let mut table = default_table();
    for (name, info) in overrides {
        table.insert(name.clone(), *info);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_known_entries() {
        let table = default_table();
        assert_eq!(table["upscayl-ultrasharp-v2"].inference_512_mb, 5314);
        assert_eq!(table.len(), ENTRIES.len());
    }

    #[test]
    fn config_override_wins_on_collision() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "upscayl-ultrasharp-v2".to_string(),
            ModelVramInfo { load_mb: 1, inference_512_mb: 2, overhead_mb: 3 },
        );
        let table = table_with_overrides(&overrides);
        assert_eq!(table["upscayl-ultrasharp-v2"].load_mb, 1);
        assert_eq!(table["upscayl-hfa2k"].load_mb, 364);
    }
}
