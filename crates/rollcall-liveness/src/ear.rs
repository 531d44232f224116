//! Eye aspect ratio.

fn dist(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// Aspect ratio of one 6-point eye contour.
///
/// `(‖p2−p6‖ + ‖p3−p5‖) / (2‖p1−p4‖)` with the points ordered outer corner,
/// upper lid ×2, inner corner, lower lid ×2. Roughly 0.25–0.35 for an open
/// eye, dropping under ~0.2 when closed. A degenerate horizontal span yields
/// 0.0 rather than a division blowup.
pub fn eye_aspect_ratio(eye: &[(f32, f32); 6]) -> f32 {
    let vertical = dist(eye[1], eye[5]) + dist(eye[2], eye[4]);
    let horizontal = dist(eye[0], eye[3]);
    if horizontal < f32::EPSILON {
        return 0.0;
    }
    vertical / (2.0 * horizontal)
}

/// Mean aspect ratio over both eyes.
pub fn average_ear(left: &[(f32, f32); 6], right: &[(f32, f32); 6]) -> f32 {
    (eye_aspect_ratio(left) + eye_aspect_ratio(right)) / 2.0
}
