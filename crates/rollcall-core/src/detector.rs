//! Face detection seam.
//!
//! The matching engine only needs candidate regions; where they come from is
//! behind the [`FaceDetector`] trait. The shipped backend is the SeetaFace
//! cascade via the `rustface` crate, loaded from a model file on disk.

use crate::types::Region;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to parse detector model: {0}")]
    ModelInvalid(String),
}

/// Tuning knobs for the detection backend.
///
/// Conservative defaults: a larger minimum face size and a higher score
/// threshold trade recall for precision, which is what an attendance scan
/// wants (a missed frame costs nothing, a false identity does).
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Smallest face edge, in pixels, the cascade will report.
    pub min_face_size: u32,
    /// Cascade score below which a window is rejected.
    pub score_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_face_size: 60,
            score_threshold: 2.5,
        }
    }
}

/// Produces candidate face regions from a grayscale frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Region>;
}

/// SeetaFace cascade detector.
pub struct SeetaDetector {
    model: rustface::Model,
    config: DetectorConfig,
}

impl SeetaDetector {
    /// Load the cascade model from `model_path`. A missing or unparseable
    /// model fails loudly here, at startup, rather than at the first frame.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }
        let file = std::fs::File::open(model_path)
            .map_err(|e| DetectorError::ModelInvalid(e.to_string()))?;
        let model = rustface::read_model(std::io::BufReader::new(file))
            .map_err(|e| DetectorError::ModelInvalid(e.to_string()))?;
        tracing::info!(
            path = model_path,
            min_face_size = config.min_face_size,
            score_threshold = config.score_threshold,
            "loaded SeetaFace cascade"
        );
        Ok(Self { model, config })
    }
}

impl FaceDetector for SeetaDetector {
    fn detect(&mut self, gray: &[u8], width: u32, height: u32) -> Vec<Region> {
        // rustface detectors are stateful per image pyramid; building one per
        // call keeps the backend free of cross-frame state.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.config.min_face_size);
        detector.set_score_thresh(self.config.score_threshold);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        let faces = detector.detect(&rustface::ImageData::new(gray, width, height));

        faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Region {
                    x: bbox.x(),
                    y: bbox.y(),
                    width: bbox.width(),
                    height: bbox.height(),
                    score: face.score(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_model() {
        let err = SeetaDetector::load("/nonexistent/cascade.bin", DetectorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn test_default_config_is_conservative() {
        let cfg = DetectorConfig::default();
        assert!(cfg.min_face_size >= 40);
        assert!(cfg.score_threshold > 2.0);
    }
}
