use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical face template edge length. Every stored template and every
/// cropped probe region is resized to this resolution before matching.
pub const TEMPLATE_SIZE: usize = 200;

/// Number of bytes in a canonical grayscale template.
pub const TEMPLATE_LEN: usize = TEMPLATE_SIZE * TEMPLATE_SIZE;

/// Store-assigned employee identifier.
pub type EmployeeId = i64;

/// Roster entry for an enrolled, active employee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeInfo {
    pub id: EmployeeId,
    /// Human-facing code, e.g. "EMP001".
    pub code: String,
    pub name: String,
}

/// A stored face template owned by exactly one employee.
///
/// `data` is a raw grayscale patch at [`TEMPLATE_SIZE`]×[`TEMPLATE_SIZE`].
/// At most one template per employee carries `is_primary` — the store
/// enforces that invariant; this crate only consumes it.
#[derive(Debug, Clone)]
pub struct FaceTemplate {
    pub data: Vec<u8>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Detector confidence for this region.
    pub score: f64,
}

/// Why a probe region produced no identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// No model has been built yet (or the last build found no templates).
    Untrained,
    /// Best distance was above the operating threshold.
    AboveThreshold,
    /// The classifier produced a non-finite or implausibly large score.
    InvalidScore,
}

/// Result of scoring one face region against the trained model.
///
/// `raw_score` is a distance: lower means a better match. `confidence` is
/// `max(0, (100 - raw_score) / 100)` and exists for display only —
/// acceptance decisions always use `raw_score` against a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub employee: Option<EmployeeId>,
    pub name: Option<String>,
    pub raw_score: f64,
    pub confidence: f64,
    pub region: Region,
    pub no_match: Option<NoMatchReason>,
}

impl RecognitionResult {
    pub fn is_match(&self) -> bool {
        self.employee.is_some()
    }

    /// Display confidence derived from a raw distance score.
    pub fn display_confidence(raw_score: f64) -> f64 {
        ((100.0 - raw_score) / 100.0).max(0.0)
    }
}

/// Why an identifying frame was rejected before any scoring happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameRejection {
    /// No candidate face region in the frame.
    NoFace,
    /// More than one face: ambiguous input for the identifying path.
    MultipleFaces,
}

/// Provider of all templates for active identities.
///
/// The matching engine never writes templates; enrollment and primary
/// promotion live entirely in the store.
pub trait TemplateStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// All (employee, template) pairs for active enrolled employees.
    fn templates(&self) -> Result<Vec<(EmployeeInfo, FaceTemplate)>, Self::Error>;

    /// Active employees with at least one enrolled template.
    fn roster(&self) -> Result<Vec<EmployeeInfo>, Self::Error>;
}
