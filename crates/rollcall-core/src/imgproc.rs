//! Grayscale image operations shared by enrollment and matching.
//!
//! The template pipeline (CLAHE → 3×3 Gaussian blur → min-max normalization)
//! runs through [`normalize_template`] at both build time and match time.
//! Keeping it a single function is what guarantees the two sides never
//! diverge.

use crate::types::TEMPLATE_SIZE;

/// Global histogram equalization, applied to full frames before detection.
pub fn equalize_hist(gray: &mut [u8]) {
    if gray.is_empty() {
        return;
    }
    let mut hist = [0u32; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0);
    let denom = gray.len() as u32 - cdf_min;
    if denom == 0 {
        return; // constant image
    }

    let mut lut = [0u8; 256];
    for i in 0..256 {
        let v = (cdf[i].saturating_sub(cdf_min)) as f32 / denom as f32 * 255.0;
        lut[i] = v.round().clamp(0.0, 255.0) as u8;
    }
    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Contrast-Limited Adaptive Histogram Equalization, in place.
///
/// The image is split into a `grid`×`grid` tile lattice; each tile gets a
/// clipped histogram and CDF, and output pixels bilinearly interpolate
/// between the four surrounding tile CDFs. `clip_fraction` is the clip
/// ceiling as a fraction of the tile pixel count.
pub fn clahe(gray: &mut [u8], width: usize, height: usize, grid: usize, clip_fraction: f32) {
    if width == 0 || height == 0 || grid == 0 || gray.len() < width * height {
        return;
    }
    let tile_w = width / grid;
    let tile_h = height / grid;
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(grid * grid);
    for row in 0..grid {
        for col in 0..grid {
            cdfs.push(tile_cdf(
                gray,
                width,
                col * tile_w,
                row * tile_h,
                tile_w,
                tile_h,
                clip_fraction,
            ));
        }
    }

    for y in 0..height {
        for x in 0..width {
            let pixel = gray[y * width + x] as usize;

            let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(grid - 1);
            let c1 = (c0 + 1).min(grid - 1);
            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let top = cdfs[r0 * grid + c0][pixel] * (1.0 - dx) + cdfs[r0 * grid + c1][pixel] * dx;
            let bot = cdfs[r1 * grid + c0][pixel] * (1.0 - dx) + cdfs[r1 * grid + c1][pixel] * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray[y * width + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clipped, normalized CDF for one CLAHE tile, mapped to 0–255.
fn tile_cdf(
    gray: &[u8],
    width: usize,
    x0: usize,
    y0: usize,
    tile_w: usize,
    tile_h: usize,
    clip_fraction: f32,
) -> [f32; 256] {
    let tile_pixels = tile_w * tile_h;
    let mut hist = [0u32; 256];
    for y in y0..y0 + tile_h {
        for x in x0..x0 + tile_w {
            hist[gray[y * width + x] as usize] += 1;
        }
    }

    // Clip and redistribute the excess uniformly.
    let clip = (clip_fraction * tile_pixels as f32).max(1.0) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for i in 0..256 {
        running += hist[i] as f32;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = tile_pixels as f32 - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

/// Separable 3×3 Gaussian blur ([1 2 1]/4 per axis), in place.
pub fn gaussian_blur_3(gray: &mut [u8], width: usize, height: usize) {
    if width < 3 || height < 3 || gray.len() < width * height {
        return;
    }
    let mut tmp = vec![0u16; width * height];

    // Horizontal pass (edge pixels replicate their neighbor).
    for y in 0..height {
        for x in 0..width {
            let xl = x.saturating_sub(1);
            let xr = (x + 1).min(width - 1);
            let sum = gray[y * width + xl] as u16
                + 2 * gray[y * width + x] as u16
                + gray[y * width + xr] as u16;
            tmp[y * width + x] = sum;
        }
    }
    // Vertical pass; combined divisor 16.
    for y in 0..height {
        let yt = y.saturating_sub(1);
        let yb = (y + 1).min(height - 1);
        for x in 0..width {
            let sum = tmp[yt * width + x] + 2 * tmp[y * width + x] + tmp[yb * width + x];
            gray[y * width + x] = ((sum + 8) / 16).min(255) as u8;
        }
    }
}

/// Stretch intensities so the darkest pixel maps to 0 and the brightest
/// to 255. Constant images are left unchanged.
pub fn minmax_normalize(gray: &mut [u8]) {
    let Some(&min) = gray.iter().min() else {
        return;
    };
    let max = *gray.iter().max().unwrap_or(&min);
    if max == min {
        return;
    }
    let range = (max - min) as f32;
    for p in gray.iter_mut() {
        *p = ((*p - min) as f32 / range * 255.0).round() as u8;
    }
}

/// Bilinear resize of a grayscale buffer.
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return vec![0; dst_w * dst_h];
    }
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;

    let mut dst = vec![0u8; dst_w * dst_h];
    for y in 0..dst_h {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (sy as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = sy - y0 as f32;

        for x in 0..dst_w {
            let sx = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (sx as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = sx - x0 as f32;

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;
            dst[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    dst
}

/// Crop a region expanded by `pad_fraction` of its width on every side,
/// clamped to the frame bounds. Returns the crop and its dimensions.
pub fn crop_padded(
    gray: &[u8],
    width: usize,
    height: usize,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
    pad_fraction: f32,
) -> (Vec<u8>, usize, usize) {
    let pad = (pad_fraction * w as f32) as i32;
    let x1 = (x - pad).max(0) as usize;
    let y1 = (y - pad).max(0) as usize;
    let x2 = ((x + w as i32 + pad).max(0) as usize).min(width);
    let y2 = ((y + h as i32 + pad).max(0) as usize).min(height);

    if x2 <= x1 || y2 <= y1 {
        return (Vec::new(), 0, 0);
    }

    let cw = x2 - x1;
    let ch = y2 - y1;
    let mut crop = Vec::with_capacity(cw * ch);
    for row in y1..y2 {
        crop.extend_from_slice(&gray[row * width + x1..row * width + x2]);
    }
    (crop, cw, ch)
}

/// The fixed template pipeline: CLAHE → light blur → min-max normalization.
///
/// `patch` must already be at the canonical [`TEMPLATE_SIZE`] resolution.
pub fn normalize_template(patch: &mut [u8]) {
    debug_assert_eq!(patch.len(), TEMPLATE_SIZE * TEMPLATE_SIZE);
    clahe(patch, TEMPLATE_SIZE, TEMPLATE_SIZE, 8, 0.008);
    gaussian_blur_3(patch, TEMPLATE_SIZE, TEMPLATE_SIZE);
    minmax_normalize(patch);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let var = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        var.sqrt()
    }

    #[test]
    fn test_equalize_hist_spreads_range() {
        // Narrow band 100..=110 should stretch toward the full range.
        let mut gray: Vec<u8> = (0..1024).map(|i| 100 + (i % 11) as u8).collect();
        equalize_hist(&mut gray);
        assert!(gray.iter().any(|&p| p < 40));
        assert!(gray.iter().any(|&p| p > 215));
    }

    #[test]
    fn test_equalize_hist_constant_unchanged() {
        let mut gray = vec![77u8; 256];
        equalize_hist(&mut gray);
        assert!(gray.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let w = 32usize;
        let mut gray: Vec<u8> = (0..w * w).map(|i| 100 + (i % 11) as u8).collect();
        let before = stddev(&gray);
        clahe(&mut gray, w, w, 4, 0.02);
        assert!(stddev(&gray) > before);
    }

    #[test]
    fn test_clahe_tiny_image_noop() {
        let mut gray = vec![10u8, 20, 30, 40];
        let orig = gray.clone();
        clahe(&mut gray, 2, 2, 8, 0.02);
        assert_eq!(gray, orig);
    }

    #[test]
    fn test_blur_smooths_impulse() {
        let w = 5usize;
        let mut gray = vec![0u8; w * w];
        gray[2 * w + 2] = 160;
        gaussian_blur_3(&mut gray, w, w);
        // Center keeps 4/16 of the impulse, edge neighbors get 2/16.
        assert_eq!(gray[2 * w + 2], 40);
        assert_eq!(gray[2 * w + 1], 20);
        assert_eq!(gray[1 * w + 2], 20);
        assert_eq!(gray[1 * w + 1], 10);
    }

    #[test]
    fn test_blur_uniform_stays_uniform() {
        let mut gray = vec![128u8; 16 * 16];
        gaussian_blur_3(&mut gray, 16, 16);
        assert!(gray.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_minmax_full_stretch() {
        let mut gray = vec![50u8, 100, 150];
        minmax_normalize(&mut gray);
        assert_eq!(gray, vec![0, 128, 255]);
    }

    #[test]
    fn test_minmax_constant_unchanged() {
        let mut gray = vec![90u8; 10];
        minmax_normalize(&mut gray);
        assert!(gray.iter().all(|&p| p == 90));
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = vec![128u8; 100 * 100];
        let dst = resize_bilinear(&src, 100, 100, 200, 200);
        assert_eq!(dst.len(), 200 * 200);
        assert!(dst.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_resize_identity() {
        let src: Vec<u8> = (0..64).map(|i| (i * 4) as u8).collect();
        let dst = resize_bilinear(&src, 8, 8, 8, 8);
        assert_eq!(src, dst);
    }

    #[test]
    fn test_crop_padded_interior() {
        // 10x10 frame, 4x4 box at (3,3), 25% padding → 1px on each side.
        let w = 10usize;
        let gray: Vec<u8> = (0..w * w).map(|i| i as u8).collect();
        let (crop, cw, ch) = crop_padded(&gray, w, w, 3, 3, 4, 4, 0.25);
        assert_eq!((cw, ch), (6, 6));
        assert_eq!(crop[0], gray[2 * w + 2]);
    }

    #[test]
    fn test_crop_padded_clamps_at_edges() {
        let w = 10usize;
        let gray = vec![1u8; w * w];
        let (crop, cw, ch) = crop_padded(&gray, w, w, 0, 0, 8, 8, 0.25);
        // Padding past the top-left is clamped away.
        assert_eq!((cw, ch), (10, 10));
        assert_eq!(crop.len(), 100);
    }

    #[test]
    fn test_crop_degenerate_box_empty() {
        let gray = vec![0u8; 100];
        let (crop, cw, ch) = crop_padded(&gray, 10, 10, 20, 20, 4, 4, 0.1);
        assert!(crop.is_empty());
        assert_eq!((cw, ch), (0, 0));
    }

    #[test]
    fn test_normalize_template_deterministic() {
        // Build and match sides must produce identical bytes for the same
        // input patch.
        let mut a: Vec<u8> = (0..TEMPLATE_SIZE * TEMPLATE_SIZE)
            .map(|i| ((i * 7) % 251) as u8)
            .collect();
        let mut b = a.clone();
        normalize_template(&mut a);
        normalize_template(&mut b);
        assert_eq!(a, b);
    }
}
