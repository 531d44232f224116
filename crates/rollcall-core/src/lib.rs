//! Face matching for attendance capture.
//!
//! Detection is a seam ([`detector::FaceDetector`]), preprocessing is one
//! shared pipeline ([`imgproc::normalize_template`]) used identically when
//! enrolling templates and when scoring probes, and the classifier is an
//! LBPH nearest-neighbor matcher whose raw score is a distance: lower is
//! better, and every acceptance decision compares it to a threshold.

pub mod detector;
pub mod engine;
pub mod imgproc;
pub mod lbph;
pub mod types;

pub use detector::{DetectorConfig, DetectorError, FaceDetector, SeetaDetector};
pub use engine::{BuildReport, ConfirmOutcome, IdentifyOutcome, MatchEngine, Thresholds};
pub use lbph::TrainedModel;
pub use types::{
    EmployeeId, EmployeeInfo, FaceTemplate, FrameRejection, NoMatchReason, RecognitionResult,
    Region, TemplateStore, TEMPLATE_LEN, TEMPLATE_SIZE,
};
