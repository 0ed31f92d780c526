//! Tile-based upscaler engine (§4.H).
//!
//! Decides whether an image needs tiling, runs the model directly or
//! tile-by-tile with cosine-tapered blending, and reassembles alpha
//! separately from color.

use image::imageops::FilterType;
use image::{GrayImage, ImageBuffer, Luma};
use pie4k_shared::error::{Pie4kError, Result};

use crate::allocator::TrackingAllocator;
use crate::model::SuperResolutionModel;

/// One tile's placement in input-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

pub struct UpscaleEngine<'m> {
    model: &'m dyn SuperResolutionModel,
    tile_size: u32,
    overlap: u32,
    allocator: Option<&'m TrackingAllocator>,
}

impl<'m> UpscaleEngine<'m> {
    pub fn new(model: &'m dyn SuperResolutionModel, tile_size: u32, overlap: u32) -> Self {
        UpscaleEngine { model, tile_size, overlap, allocator: None }
    }

    /// Routes every tile buffer and the accumulator/weight-map buffers
    /// this engine allocates through `allocator`, so `force_cleanup`
    /// reclaims real, measured bytes (§4.H "Allocator").
    pub fn with_allocator(
        model: &'m dyn SuperResolutionModel,
        tile_size: u32,
        overlap: u32,
        allocator: &'m TrackingAllocator,
    ) -> Self {
        UpscaleEngine { model, tile_size, overlap, allocator: Some(allocator) }
    }

    fn track(&self, bytes: usize) -> Option<u64> {
        self.allocator.map(|a| a.track(bytes))
    }

    fn untrack(&self, handle: Option<u64>) {
        if let (Some(a), Some(id)) = (self.allocator, handle) {
            a.free(id);
        }
    }

    /// `needs_tiling = (w > tile_size) ∨ (h > tile_size)` (§4.H).
    pub fn needs_tiling(&self, width: u32, height: u32) -> bool {
        width > self.tile_size || height > self.tile_size
    }

    /// Upscale a packed 8-bit image. `channels` must be 3 (BGR) or 4
    /// (BGRA); alpha, when present, is split off, never passed to the
    /// model, and merged back via nearest-neighbor resize.
    pub fn upscale(&self, image: &[u8], width: u32, height: u32, channels: u32) -> Result<(Vec<u8>, u32, u32)> {
        match channels {
            3 => self.upscale_bgr(image, width, height),
            4 => self.upscale_bgra(image, width, height),
            other => Err(Pie4kError::Upscale(format!("unsupported channel count {other}"))),
        }
    }

    fn upscale_bgr(&self, image: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, u32, u32)> {
        if self.needs_tiling(width, height) {
            Ok(self.upscale_tiled(image, width, height))
        } else {
            Ok(direct_upscale(image, width, height, self.model))
        }
    }

    fn upscale_bgra(&self, image: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, u32, u32)> {
        let plane_len = (width * height) as usize;
        let mut bgr = vec![0u8; plane_len * 3];
        let mut alpha = vec![0u8; plane_len];
        for i in 0..plane_len {
            bgr[i * 3] = image[i * 4];
            bgr[i * 3 + 1] = image[i * 4 + 1];
            bgr[i * 3 + 2] = image[i * 4 + 2];
            alpha[i] = image[i * 4 + 3];
        }

        let (bgr_out, out_w, out_h) = self.upscale_bgr(&bgr, width, height)?;
        let alpha_out = nearest_resize_gray(&alpha, width, height, out_w, out_h);

        let out_plane = (out_w * out_h) as usize;
        let mut out = vec![0u8; out_plane * 4];
        for i in 0..out_plane {
            out[i * 4] = bgr_out[i * 3];
            out[i * 4 + 1] = bgr_out[i * 3 + 1];
            out[i * 4 + 2] = bgr_out[i * 3 + 2];
            out[i * 4 + 3] = alpha_out[i];
        }
        Ok((out, out_w, out_h))
    }

    fn upscale_tiled(&self, image: &[u8], width: u32, height: u32) -> (Vec<u8>, u32, u32) {
        let scale = self.model.scale();
        let out_w = width * scale;
        let out_h = height * scale;
        let regions = generate_tile_regions(width, height, self.tile_size, self.overlap);

        let accumulator_handle = self.track((out_w * out_h * 3) as usize * std::mem::size_of::<f32>());
        let mut accumulator = vec![0f32; (out_w * out_h * 3) as usize];
        let weights_handle = self.track((out_w * out_h) as usize * std::mem::size_of::<f32>());
        let mut weights = vec![0f32; (out_w * out_h) as usize];

        for region in &regions {
            let tile_bytes = extract_tile(image, width, *region);
            let tile_handle = self.track(tile_bytes.len());
            let (tile_float, tile_out_w, tile_out_h) = direct_upscale_f32(&tile_bytes, region.w, region.h, self.model);
            let tile_float_handle = self.track(tile_float.len() * std::mem::size_of::<f32>());
            let mask = build_blend_mask(*region, width, height, self.overlap, scale);
            let mask_handle = self.track(mask.len() * std::mem::size_of::<f32>());

            let roi_x = region.x * scale;
            let roi_y = region.y * scale;
            for ty in 0..tile_out_h {
                for tx in 0..tile_out_w {
                    let ox = roi_x + tx;
                    let oy = roi_y + ty;
                    if ox >= out_w || oy >= out_h {
                        continue;
                    }
                    let out_idx = (oy * out_w + ox) as usize;
                    let tile_idx = (ty * tile_out_w + tx) as usize;
                    let w = mask[tile_idx];
                    accumulator[out_idx * 3] += tile_float[tile_idx * 3] * w;
                    accumulator[out_idx * 3 + 1] += tile_float[tile_idx * 3 + 1] * w;
                    accumulator[out_idx * 3 + 2] += tile_float[tile_idx * 3 + 2] * w;
                    weights[out_idx] += w;
                }
            }

            self.untrack(mask_handle);
            self.untrack(tile_float_handle);
            self.untrack(tile_handle);
        }

        let mut out = vec![0u8; (out_w * out_h * 3) as usize];
        for i in 0..(out_w * out_h) as usize {
            let w = weights[i].max(1e-6);
            out[i * 3] = (accumulator[i * 3] / w).clamp(0.0, 255.0).round() as u8;
            out[i * 3 + 1] = (accumulator[i * 3 + 1] / w).clamp(0.0, 255.0).round() as u8;
            out[i * 3 + 2] = (accumulator[i * 3 + 2] / w).clamp(0.0, 255.0).round() as u8;
        }
        self.untrack(weights_handle);
        self.untrack(accumulator_handle);
        (out, out_w, out_h)
    }
}

/// Idempotent at `scale=1`: returns the input unchanged (§8 invariant 9).
fn direct_upscale(bgr: &[u8], width: u32, height: u32, model: &dyn SuperResolutionModel) -> (Vec<u8>, u32, u32) {
    if model.scale() == 1 {
        return (bgr.to_vec(), width, height);
    }
    let (floats, out_w, out_h) = direct_upscale_f32(bgr, width, height, model);
    let out = floats.iter().map(|v| v.round() as u8).collect();
    (out, out_w, out_h)
}

/// Same as [`direct_upscale`] but returns clamped floats before
/// quantization, for tile accumulation.
fn direct_upscale_f32(bgr: &[u8], width: u32, height: u32, model: &dyn SuperResolutionModel) -> (Vec<f32>, u32, u32) {
    if model.scale() == 1 {
        let floats = bgr.iter().map(|&b| b as f32).collect();
        return (floats, width, height);
    }

    let plane_len = (width * height) as usize;
    let mut rgb = vec![0f32; plane_len * 3];
    for i in 0..plane_len {
        let px = i * 3;
        rgb[i] = bgr[px + 2] as f32 / 255.0; // R
        rgb[plane_len + i] = bgr[px + 1] as f32 / 255.0; // G
        rgb[2 * plane_len + i] = bgr[px] as f32 / 255.0; // B
    }

    let out = model.forward(&rgb, width, height);
    let out_w = width * model.scale();
    let out_h = height * model.scale();
    let out_plane = (out_w * out_h) as usize;
    let mut bgr_f = vec![0f32; out_plane * 3];
    for i in 0..out_plane {
        let r = (out[i] * 255.0).clamp(0.0, 255.0);
        let g = (out[out_plane + i] * 255.0).clamp(0.0, 255.0);
        let b = (out[2 * out_plane + i] * 255.0).clamp(0.0, 255.0);
        bgr_f[i * 3] = b;
        bgr_f[i * 3 + 1] = g;
        bgr_f[i * 3 + 2] = r;
    }
    (bgr_f, out_w, out_h)
}

fn extract_tile(image: &[u8], width: u32, region: TileRegion) -> Vec<u8> {
    let mut out = vec![0u8; (region.w * region.h * 3) as usize];
    for y in 0..region.h {
        for x in 0..region.w {
            let src_idx = (((region.y + y) * width + (region.x + x)) * 3) as usize;
            let dst_idx = ((y * region.w + x) * 3) as usize;
            out[dst_idx] = image[src_idx];
            out[dst_idx + 1] = image[src_idx + 1];
            out[dst_idx + 2] = image[src_idx + 2];
        }
    }
    out
}

/// Tile layout: starts at 0, steps by `tile_size - overlap`, and always
/// includes a final tile flush with the far edge (§4.H, §8 S5).
pub fn generate_tile_regions(width: u32, height: u32, tile_size: u32, overlap: u32) -> Vec<TileRegion> {
    let xs = axis_positions(width, tile_size, overlap);
    let ys = axis_positions(height, tile_size, overlap);
    let mut regions = Vec::with_capacity(xs.len() * ys.len());
    for &y in &ys {
        for &x in &xs {
            let w = tile_size.min(width - x);
            let h = tile_size.min(height - y);
            regions.push(TileRegion { x, y, w, h });
        }
    }
    regions
}

fn axis_positions(dim: u32, tile_size: u32, overlap: u32) -> Vec<u32> {
    if dim <= tile_size {
        return vec![0];
    }
    let step = tile_size.saturating_sub(overlap).max(1);
    let mut positions = Vec::new();
    let mut x = 0u32;
    loop {
        positions.push(x);
        if x + tile_size >= dim {
            break;
        }
        x += step;
    }
    positions
}

/// Cosine-taper blend mask for one tile, built at the input tile's size
/// then resized (bilinear) to the output tile size (§4.H step 2.b).
///
/// An edge of the tile that coincides with the image's outer boundary is
/// never tapered (there is no neighbor to blend against there); tapering
/// only the ribbons that actually overlap a neighbor is what keeps every
/// output pixel's weight positive (§8 invariant 4).
fn build_blend_mask(region: TileRegion, image_w: u32, image_h: u32, overlap: u32, scale: u32) -> Vec<f32> {
    let ov = overlap.min(region.w.min(region.h) / 2);
    let taper_x = axis_taper(region.w, ov, region.x == 0, region.x + region.w >= image_w);
    let taper_y = axis_taper(region.h, ov, region.y == 0, region.y + region.h >= image_h);

    let mut base = vec![0f32; (region.w * region.h) as usize];
    for y in 0..region.h {
        for x in 0..region.w {
            base[(y * region.w + x) as usize] = taper_x[x as usize] * taper_y[y as usize];
        }
    }

    if scale == 1 {
        return base;
    }
    resize_mask_bilinear(&base, region.w, region.h, region.w * scale, region.h * scale)
}

fn axis_taper(len: u32, overlap: u32, at_start_edge: bool, at_end_edge: bool) -> Vec<f32> {
    let mut out = vec![1.0f32; len as usize];
    if overlap == 0 {
        return out;
    }
    for d in 0..overlap.min(len) {
        let t = (0.5 * (1.0 - (std::f64::consts::PI * d as f64 / overlap as f64).cos())) as f32;
        if !at_start_edge {
            out[d as usize] = out[d as usize].min(t);
        }
        if !at_end_edge {
            let idx = (len - 1 - d) as usize;
            out[idx] = out[idx].min(t);
        }
    }
    out
}

fn resize_mask_bilinear(mask: &[f32], w: u32, h: u32, out_w: u32, out_h: u32) -> Vec<f32> {
    let buf = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w, h, mask.to_vec()).expect("mask buffer size mismatch");
    let resized = image::imageops::resize(&buf, out_w, out_h, FilterType::Triangle);
    resized.into_raw()
}

fn nearest_resize_gray(plane: &[u8], width: u32, height: u32, out_w: u32, out_h: u32) -> Vec<u8> {
    let buf = GrayImage::from_raw(width, height, plane.to_vec()).expect("alpha plane size mismatch");
    let resized = image::imageops::resize(&buf, out_w, out_h, FilterType::Nearest);
    resized.into_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LanczosModel;

    #[test]
    fn tile_region_count_matches_scenario_s5() {
        let regions = generate_tile_regions(2000, 1000, 512, 32);
        assert_eq!(regions.len(), 15);
    }

    #[test]
    fn tile_regions_cover_the_full_rectangle() {
        let width = 2000;
        let height = 1000;
        let regions = generate_tile_regions(width, height, 512, 32);
        let mut covered = vec![false; (width * height) as usize];
        for region in &regions {
            for y in region.y..region.y + region.h {
                for x in region.x..region.x + region.w {
                    covered[(y * width + x) as usize] = true;
                }
            }
        }
        assert!(covered.into_iter().all(|c| c));
    }

    #[test]
    fn scale_one_direct_path_is_idempotent() {
        let model = LanczosModel::new(1);
        let engine = UpscaleEngine::new(&model, 512, 32);
        let width = 8;
        let height = 4;
        let input: Vec<u8> = (0..width * height * 3).map(|v| (v % 256) as u8).collect();
        let (out, out_w, out_h) = engine.upscale(&input, width, height, 3).unwrap();
        assert_eq!(out_w, width);
        assert_eq!(out_h, height);
        assert_eq!(out, input);
    }

    #[test]
    fn interior_pixel_weight_is_exactly_one() {
        // A single tile covering the whole (small) image: no neighbors,
        // so every output pixel is "interior" and must carry weight 1.0.
        let width = 64;
        let height = 64;
        let region = TileRegion { x: 0, y: 0, w: width, h: height };
        let mask = build_blend_mask(region, width, height, 16, 1);
        assert!(mask.iter().all(|&w| (w - 1.0).abs() < 1e-6));
    }

    #[test]
    fn combined_tile_weights_satisfy_invariants() {
        // Combine every tile's mask the same way `upscale_tiled` does, and
        // check §8 invariants 4 and 5 against the full weight map rather
        // than any single tile's mask (which legitimately tapers to 0 at
        // an edge a neighbor is responsible for).
        let width = 256;
        let height = 64;
        let overlap = 32;
        let regions = generate_tile_regions(width, height, 128, overlap);
        assert!(regions.len() > 1);

        let mut weights = vec![0f32; (width * height) as usize];
        for region in &regions {
            let mask = build_blend_mask(*region, width, height, overlap, 1);
            for y in 0..region.h {
                for x in 0..region.w {
                    let idx = ((region.y + y) * width + (region.x + x)) as usize;
                    weights[idx] += mask[(y * region.w + x) as usize];
                }
            }
        }

        assert!(weights.iter().all(|&w| w >= 1e-6));

        // x=10 is well inside tile 0's non-overlap interior (tile 0 spans
        // [0,128), its overlap ribbon with tile 1 starts at x=96).
        let idx = (32 * width + 10) as usize;
        assert!((weights[idx] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn four_channel_image_preserves_alpha_plane_length() {
        let model = LanczosModel::new(2);
        let engine = UpscaleEngine::new(&model, 512, 32);
        let width = 4;
        let height = 4;
        let input: Vec<u8> = (0..width * height * 4).map(|v| (v % 256) as u8).collect();
        let (out, out_w, out_h) = engine.upscale(&input, width, height, 4).unwrap();
        assert_eq!(out.len() as u32, out_w * out_h * 4);
    }

    #[test]
    fn tiled_upscale_tracks_and_frees_every_buffer_through_the_allocator() {
        let model = LanczosModel::new(2);
        let allocator = TrackingAllocator::new();
        let engine = UpscaleEngine::with_allocator(&model, 64, 16, &allocator);
        let width = 128;
        let height = 64;
        let input: Vec<u8> = (0..width * height * 3).map(|v| (v % 256) as u8).collect();
        assert!(engine.needs_tiling(width, height));

        let (out, out_w, out_h) = engine.upscale(&input, width, height, 3).unwrap();
        assert_eq!(out.len() as u32, out_w * out_h * 3);

        // Every tracked buffer (accumulator, weight map, per-tile scratch)
        // is freed again once the image is fully stitched.
        assert_eq!(allocator.total_allocated(), 0);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn unsupported_channel_count_is_rejected() {
        let model = LanczosModel::new(4);
        let engine = UpscaleEngine::new(&model, 512, 32);
        let result = engine.upscale(&[0u8; 8], 2, 2, 2);
        assert!(result.is_err());
    }
}
