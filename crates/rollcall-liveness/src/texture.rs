//! Texture sharpness via the variance of the Laplacian.
//!
//! Printed photos and phone screens held up to the camera lose high-frequency
//! detail; their Laplacian response is markedly flatter than live skin.

/// Variance of the 4-neighbor Laplacian over the interior of a grayscale crop.
///
/// Crops smaller than 3×3 have no interior and score 0.0.
pub fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity((width - 2) * (height - 2));
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray[y * width + x] as f64;
            let lap = gray[(y - 1) * width + x] as f64
                + gray[(y + 1) * width + x] as f64
                + gray[y * width + x - 1] as f64
                + gray[y * width + x + 1] as f64
                - 4.0 * center;
            responses.push(lap);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_crop_is_flat() {
        let crop = vec![128u8; 20 * 20];
        assert_eq!(laplacian_variance(&crop, 20, 20), 0.0);
    }

    #[test]
    fn test_smooth_gradient_is_nearly_flat() {
        let w = 32;
        let crop: Vec<u8> = (0..w * w).map(|i| ((i % w) * 4) as u8).collect();
        // A linear ramp has zero second derivative along its axis.
        assert!(laplacian_variance(&crop, w, w) < 1.0);
    }

    #[test]
    fn test_fine_checkerboard_is_sharp() {
        let w = 32;
        let crop: Vec<u8> = (0..w * w)
            .map(|i| if (i % w + i / w) % 2 == 0 { 255 } else { 0 })
            .collect();
        assert!(laplacian_variance(&crop, w, w) > 1000.0);
    }

    #[test]
    fn test_tiny_crop_scores_zero() {
        let crop = vec![10u8, 200, 30, 90];
        assert_eq!(laplacian_variance(&crop, 2, 2), 0.0);
    }

    #[test]
    fn test_sharp_beats_flat() {
        let w = 32;
        let sharp: Vec<u8> = (0..w * w)
            .map(|i| if (i * 7) % 13 < 6 { 220 } else { 40 })
            .collect();
        let flat = vec![128u8; w * w];
        assert!(laplacian_variance(&sharp, w, w) > laplacian_variance(&flat, w, w));
    }
}
