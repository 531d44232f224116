//! Matching engine: detection, scoring, and the two call paths.
//!
//! The identifying path serves the ambient camera loop and must be strict:
//! an uncertain frame is cheap to discard. The confirmatory path serves a
//! self-service check-in where the employee already claims an identity, so
//! it runs a lenient threshold but rejects a *different* recognized identity
//! outright.

use crate::detector::FaceDetector;
use crate::imgproc;
use crate::lbph::{self, TrainedModel};
use crate::types::{
    EmployeeId, EmployeeInfo, FaceTemplate, FrameRejection, NoMatchReason, RecognitionResult,
    Region, TEMPLATE_SIZE,
};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Fraction of the region width added as padding on every side before crop.
const REGION_PAD: f32 = 0.10;

/// Scores at or beyond this are treated as classifier malfunction.
const IMPLAUSIBLE_SCORE: f64 = 10_000.0;

/// Operating thresholds for the raw distance score (lower = better).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Identifying path: unknown subject, so be strict.
    pub strict: f64,
    /// Confirmatory path: claimed identity, so be lenient.
    pub lenient: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            strict: 65.0,
            lenient: 85.0,
        }
    }
}

/// Outcome of the identifying path for one frame.
#[derive(Debug, Clone)]
pub enum IdentifyOutcome {
    /// Exactly one face was found and scored (match or reasoned non-match).
    Scored(RecognitionResult),
    /// The frame never reached the classifier.
    Rejected(FrameRejection),
}

/// Outcome of the confirmatory path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed { result: RecognitionResult },
    NoFace,
    MultipleFaces,
    /// Best score was above the lenient threshold (or invalid).
    NotRecognized { result: RecognitionResult },
    /// A face was recognized, but it is not the claimed employee.
    IdentityMismatch { result: RecognitionResult },
}

/// What a model rebuild produced.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BuildReport {
    pub trained: bool,
    pub templates: usize,
    pub identities: usize,
}

pub struct MatchEngine {
    detector: Box<dyn FaceDetector>,
    model: RwLock<Option<Arc<TrainedModel>>>,
    thresholds: Thresholds,
}

impl MatchEngine {
    pub fn new(detector: Box<dyn FaceDetector>, thresholds: Thresholds) -> Self {
        Self {
            detector,
            model: RwLock::new(None),
            thresholds,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.read().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Rebuild the trained model from the full template set.
    ///
    /// An empty or all-invalid set is a soft failure: the previous model
    /// keeps serving and the report says `trained = false` only when no
    /// model exists at all afterwards.
    pub fn rebuild(&self, templates: &[(EmployeeInfo, FaceTemplate)]) -> BuildReport {
        match lbph::train(templates) {
            Some(model) => {
                let report = BuildReport {
                    trained: true,
                    templates: model.template_count(),
                    identities: model.identity_count(),
                };
                if let Ok(mut slot) = self.model.write() {
                    *slot = Some(model);
                }
                report
            }
            None => BuildReport {
                trained: self.is_trained(),
                templates: 0,
                identities: 0,
            },
        }
    }

    /// Identifying path: histogram-equalize the frame, detect, and score.
    ///
    /// Zero faces and two-or-more faces are both rejected before scoring;
    /// the ambient loop has no identity claim to disambiguate with.
    pub fn identify(&mut self, frame: &[u8], width: u32, height: u32) -> IdentifyOutcome {
        let mut gray = frame.to_vec();
        imgproc::equalize_hist(&mut gray);

        let regions = self.detector.detect(&gray, width, height);
        match regions.len() {
            0 => IdentifyOutcome::Rejected(FrameRejection::NoFace),
            1 => IdentifyOutcome::Scored(self.score_region(
                &gray,
                width,
                height,
                regions[0],
                self.thresholds.strict,
            )),
            n => {
                tracing::debug!(faces = n, "ambiguous frame rejected");
                IdentifyOutcome::Rejected(FrameRejection::MultipleFaces)
            }
        }
    }

    /// Confirmatory path: exactly one face, lenient threshold, and the best
    /// match must be the claimed employee.
    pub fn confirm(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        claimed: EmployeeId,
    ) -> ConfirmOutcome {
        let mut gray = frame.to_vec();
        imgproc::equalize_hist(&mut gray);

        let regions = self.detector.detect(&gray, width, height);
        let region = match regions.len() {
            0 => return ConfirmOutcome::NoFace,
            1 => regions[0],
            _ => return ConfirmOutcome::MultipleFaces,
        };

        let result = self.score_region(&gray, width, height, region, self.thresholds.lenient);
        match result.employee {
            Some(id) if id == claimed => ConfirmOutcome::Confirmed { result },
            Some(_) => {
                tracing::warn!(
                    claimed,
                    matched = ?result.employee,
                    raw_score = result.raw_score,
                    "confirmation matched a different identity"
                );
                ConfirmOutcome::IdentityMismatch { result }
            }
            None => ConfirmOutcome::NotRecognized { result },
        }
    }

    /// Extract a canonical enrollment template from a frame.
    ///
    /// Runs the same equalization, detection, and padded-crop convention as
    /// the matching paths and requires exactly one face. The returned patch
    /// is the raw resized crop; pipeline normalization stays a build-time
    /// step so stored templates and probes go through it identically.
    pub fn extract_template(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, FrameRejection> {
        let mut gray = frame.to_vec();
        imgproc::equalize_hist(&mut gray);

        let regions = self.detector.detect(&gray, width, height);
        let region = match regions.len() {
            0 => return Err(FrameRejection::NoFace),
            1 => regions[0],
            _ => return Err(FrameRejection::MultipleFaces),
        };

        let (crop, cw, ch) = imgproc::crop_padded(
            &gray,
            width as usize,
            height as usize,
            region.x,
            region.y,
            region.width,
            region.height,
            REGION_PAD,
        );
        Ok(imgproc::resize_bilinear(&crop, cw, ch, TEMPLATE_SIZE, TEMPLATE_SIZE))
    }

    /// Crop, canonicalize, and classify one region.
    ///
    /// Never errors and never panics: an untrained model and a broken score
    /// both surface as reasoned non-matches.
    fn score_region(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
        region: Region,
        threshold: f64,
    ) -> RecognitionResult {
        let model = match self.model.read().ok().and_then(|m| m.clone()) {
            Some(model) => model,
            None => return non_match(region, NoMatchReason::Untrained),
        };

        let (crop, cw, ch) = imgproc::crop_padded(
            gray,
            width as usize,
            height as usize,
            region.x,
            region.y,
            region.width,
            region.height,
            REGION_PAD,
        );
        let mut patch = imgproc::resize_bilinear(&crop, cw, ch, TEMPLATE_SIZE, TEMPLATE_SIZE);
        imgproc::normalize_template(&mut patch);

        let prediction = match model.predict(&patch) {
            Some(p) => p,
            None => return non_match(region, NoMatchReason::Untrained),
        };

        if !prediction.distance.is_finite() || prediction.distance >= IMPLAUSIBLE_SCORE {
            tracing::warn!(distance = prediction.distance, "implausible classifier score");
            return non_match(region, NoMatchReason::InvalidScore);
        }

        if prediction.distance > threshold {
            return RecognitionResult {
                employee: None,
                name: None,
                raw_score: prediction.distance,
                confidence: RecognitionResult::display_confidence(prediction.distance),
                region,
                no_match: Some(NoMatchReason::AboveThreshold),
            };
        }

        // Label came out of predict on this same model, so it resolves.
        let info = model.label_info(prediction.label);
        RecognitionResult {
            employee: info.map(|i| i.employee),
            name: info.map(|i| i.name.clone()),
            raw_score: prediction.distance,
            confidence: RecognitionResult::display_confidence(prediction.distance),
            region,
            no_match: if info.is_some() {
                None
            } else {
                Some(NoMatchReason::InvalidScore)
            },
        }
    }
}

fn non_match(region: Region, reason: NoMatchReason) -> RecognitionResult {
    RecognitionResult {
        employee: None,
        name: None,
        raw_score: IMPLAUSIBLE_SCORE,
        confidence: 0.0,
        region,
        no_match: Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Detector stub returning a fixed region list regardless of input.
    struct StubDetector {
        regions: Vec<Region>,
    }

    impl FaceDetector for StubDetector {
        fn detect(&mut self, _gray: &[u8], _width: u32, _height: u32) -> Vec<Region> {
            self.regions.clone()
        }
    }

    fn full_frame_region() -> Region {
        Region {
            x: 0,
            y: 0,
            width: TEMPLATE_SIZE as u32,
            height: TEMPLATE_SIZE as u32,
            score: 5.0,
        }
    }

    fn engine_with(regions: Vec<Region>) -> MatchEngine {
        MatchEngine::new(Box::new(StubDetector { regions }), Thresholds::default())
    }

    fn employee(id: EmployeeId, name: &str) -> EmployeeInfo {
        EmployeeInfo {
            id,
            code: format!("EMP{id:03}"),
            name: name.to_string(),
        }
    }

    fn template(data: Vec<u8>) -> FaceTemplate {
        FaceTemplate {
            data,
            is_primary: true,
            created_at: Utc::now(),
        }
    }

    fn gradient_frame() -> Vec<u8> {
        (0..TEMPLATE_SIZE * TEMPLATE_SIZE)
            .map(|i| {
                let x = i % TEMPLATE_SIZE;
                let y = i / TEMPLATE_SIZE;
                ((x + y) * 255 / (2 * TEMPLATE_SIZE)) as u8
            })
            .collect()
    }

    fn checker_frame() -> Vec<u8> {
        (0..TEMPLATE_SIZE * TEMPLATE_SIZE)
            .map(|i| {
                let x = (i % TEMPLATE_SIZE) / 20;
                let y = (i / TEMPLATE_SIZE) / 20;
                if (x + y) % 2 == 0 {
                    230
                } else {
                    30
                }
            })
            .collect()
    }

    fn side() -> u32 {
        TEMPLATE_SIZE as u32
    }

    #[test]
    fn test_untrained_identify_is_reasoned_non_match() {
        let mut engine = engine_with(vec![full_frame_region()]);
        match engine.identify(&gradient_frame(), side(), side()) {
            IdentifyOutcome::Scored(result) => {
                assert!(!result.is_match());
                assert_eq!(result.no_match, Some(NoMatchReason::Untrained));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_identify_rejects_empty_frame() {
        let mut engine = engine_with(vec![]);
        match engine.identify(&gradient_frame(), side(), side()) {
            IdentifyOutcome::Rejected(FrameRejection::NoFace) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_identify_rejects_two_faces() {
        let mut engine = engine_with(vec![full_frame_region(), full_frame_region()]);
        match engine.identify(&gradient_frame(), side(), side()) {
            IdentifyOutcome::Rejected(FrameRejection::MultipleFaces) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_identify_matches_enrolled_texture() {
        let mut engine = engine_with(vec![full_frame_region()]);
        let report = engine.rebuild(&[
            (employee(1, "Ada"), template(gradient_frame())),
            (employee(2, "Ben"), template(checker_frame())),
        ]);
        assert!(report.trained);
        assert_eq!(report.identities, 2);

        match engine.identify(&gradient_frame(), side(), side()) {
            IdentifyOutcome::Scored(result) => {
                assert_eq!(result.employee, Some(1));
                assert_eq!(result.name.as_deref(), Some("Ada"));
                assert!(result.raw_score < 65.0, "raw = {}", result.raw_score);
                assert!(result.confidence > 0.35);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_rebuild_soft_failure_keeps_previous_model() {
        let mut engine = engine_with(vec![full_frame_region()]);
        let first = engine.rebuild(&[(employee(1, "Ada"), template(gradient_frame()))]);
        assert!(first.trained);

        // Rebuild from nothing: the old model must keep serving.
        let second = engine.rebuild(&[]);
        assert!(second.trained);
        assert!(engine.is_trained());
        match engine.identify(&gradient_frame(), side(), side()) {
            IdentifyOutcome::Scored(result) => assert_eq!(result.employee, Some(1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_confirm_requires_exactly_one_face() {
        let mut empty = engine_with(vec![]);
        assert!(matches!(
            empty.confirm(&gradient_frame(), side(), side(), 1),
            ConfirmOutcome::NoFace
        ));

        let mut crowded = engine_with(vec![full_frame_region(), full_frame_region()]);
        assert!(matches!(
            crowded.confirm(&gradient_frame(), side(), side(), 1),
            ConfirmOutcome::MultipleFaces
        ));
    }

    #[test]
    fn test_confirm_rejects_identity_mismatch() {
        let mut engine = engine_with(vec![full_frame_region()]);
        engine.rebuild(&[
            (employee(1, "Ada"), template(gradient_frame())),
            (employee(2, "Ben"), template(checker_frame())),
        ]);

        // A gradient face claiming to be Ben is a mismatch, not a non-match.
        match engine.confirm(&gradient_frame(), side(), side(), 2) {
            ConfirmOutcome::IdentityMismatch { result } => {
                assert_eq!(result.employee, Some(1));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_confirm_accepts_claimed_identity() {
        let mut engine = engine_with(vec![full_frame_region()]);
        engine.rebuild(&[
            (employee(1, "Ada"), template(gradient_frame())),
            (employee(2, "Ben"), template(checker_frame())),
        ]);

        match engine.confirm(&gradient_frame(), side(), side(), 1) {
            ConfirmOutcome::Confirmed { result } => {
                assert_eq!(result.employee, Some(1));
                assert!(result.raw_score < 85.0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_extract_template_canonical_size() {
        let mut engine = engine_with(vec![full_frame_region()]);
        let template = engine
            .extract_template(&gradient_frame(), side(), side())
            .unwrap();
        assert_eq!(template.len(), TEMPLATE_SIZE * TEMPLATE_SIZE);
    }

    #[test]
    fn test_extract_template_requires_exactly_one_face() {
        let mut empty = engine_with(vec![]);
        assert_eq!(
            empty.extract_template(&gradient_frame(), side(), side()),
            Err(FrameRejection::NoFace)
        );

        let mut crowded = engine_with(vec![full_frame_region(), full_frame_region()]);
        assert_eq!(
            crowded.extract_template(&gradient_frame(), side(), side()),
            Err(FrameRejection::MultipleFaces)
        );
    }

    #[test]
    fn test_extracted_template_matches_its_source_frame() {
        let mut engine = engine_with(vec![full_frame_region()]);
        let patch = engine
            .extract_template(&gradient_frame(), side(), side())
            .unwrap();

        let report = engine.rebuild(&[
            (employee(1, "Ada"), template(patch)),
            (employee(2, "Ben"), template(checker_frame())),
        ]);
        assert!(report.trained);

        match engine.identify(&gradient_frame(), side(), side()) {
            IdentifyOutcome::Scored(result) => assert_eq!(result.employee, Some(1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_untrained_confirm_not_recognized() {
        let mut engine = engine_with(vec![full_frame_region()]);
        match engine.confirm(&gradient_frame(), side(), side(), 1) {
            ConfirmOutcome::NotRecognized { result } => {
                assert_eq!(result.no_match, Some(NoMatchReason::Untrained));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
