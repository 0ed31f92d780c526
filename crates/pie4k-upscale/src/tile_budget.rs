//! Optimal tile size and concurrency math (§4.I "Optimal tile size
//! computation").

use pie4k_shared::config::ModelVramInfo;

/// Reference basis pixel count the original service measured
/// `inference_512_mb` against: a 512×512 input plus its 4x (2048×2048)
/// output.
const REFERENCE_INPUT_PIXELS: f64 = 512.0 * 512.0;
const REFERENCE_OUTPUT_PIXELS: f64 = 2048.0 * 2048.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSizeRecommendation {
    pub tile_size: u32,
    pub vram_per_tile_mb: f64,
    pub max_concurrent: u32,
    pub is_safe: bool,
}

/// `usable_vram = (total − baseline) · max_vram_pct`,
/// `available_for_tiles = usable_vram − model.load_mb`,
/// `optimal_tile = sqrt(available_for_tiles / ((1+scale²) · vram_per_pixel))`,
/// rounded down to a multiple of 64 and floored at 64 (§4.I).
pub fn compute_optimal_tile_size(
    model: ModelVramInfo,
    total_vram_bytes: u64,
    baseline_used_vram_bytes: u64,
    max_vram_pct: f64,
    scale: u32,
) -> TileSizeRecommendation {
    let total_mb = total_vram_bytes as f64 / BYTES_PER_MB;
    let baseline_mb = baseline_used_vram_bytes as f64 / BYTES_PER_MB;
    let usable_vram = (total_mb - baseline_mb).max(0.0) * (max_vram_pct / 100.0);
    let available_for_tiles = (usable_vram - model.load_mb as f64).max(0.0);

    let vram_per_pixel = model.inference_512_mb as f64 / (REFERENCE_INPUT_PIXELS + REFERENCE_OUTPUT_PIXELS);
    let total_pixels_per_tile = 1.0 + (scale as f64).powi(2);

    let raw_tile = if vram_per_pixel > 0.0 {
        (available_for_tiles / (total_pixels_per_tile * vram_per_pixel)).sqrt()
    } else {
        0.0
    };
    let rounded = ((raw_tile / 64.0).floor() * 64.0) as u32;
    let tile_size = rounded.max(64);

    let input_pixels = (tile_size as f64).powi(2);
    let output_pixels = (tile_size as f64 * scale as f64).powi(2);
    let vram_per_tile_mb = ((input_pixels + output_pixels) * vram_per_pixel).max(model.overhead_mb as f64);

    let max_concurrent = if vram_per_tile_mb > 0.0 {
        (available_for_tiles / vram_per_tile_mb).floor().max(0.0) as u32
    } else {
        0
    };

    TileSizeRecommendation {
        tile_size,
        vram_per_tile_mb,
        max_concurrent,
        is_safe: max_concurrent >= 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gib(n: f64) -> u64 {
        (n * 1024.0 * 1024.0 * 1024.0) as u64
    }

    #[test]
    fn scenario_s6_yields_a_safe_multiple_of_64() {
        // §8 S6: ultrasharp-v2, total=8GiB, baseline=1GiB, MaxVRAM=90%, scale=4.
        let model = ModelVramInfo { load_mb: 364, inference_512_mb: 5314, overhead_mb: 26 };
        let rec = compute_optimal_tile_size(model, gib(8.0), gib(1.0), 90.0, 4);
        assert!(rec.tile_size >= 64);
        assert_eq!(rec.tile_size % 64, 0);
        assert!(rec.max_concurrent >= 1);
        assert!(rec.is_safe);
    }

    #[test]
    fn starved_vram_still_floors_at_64() {
        let model = ModelVramInfo { load_mb: 364, inference_512_mb: 5314, overhead_mb: 26 };
        let rec = compute_optimal_tile_size(model, gib(1.0), gib(1.0), 90.0, 4);
        assert_eq!(rec.tile_size, 64);
        assert!(!rec.is_safe);
    }
}
