//! Passive and challenge-based liveness evaluation.
//!
//! Works on facial landmarks supplied by an external [`LandmarkEstimator`];
//! when no estimator backend is available the embedding daemon simply runs
//! with liveness gating disabled. Three per-frame signals feed bounded
//! histories: eye aspect ratio (blink dynamics), head-pose yaw (natural
//! micro-movement), and Laplacian texture variance (print/screen detection).
//! The passive verdict needs any two of the three; active challenges ask for
//! a specific motion within a deadline.

pub mod ear;
pub mod pose;
pub mod session;
pub mod texture;

pub use ear::eye_aspect_ratio;
pub use pose::{solve_head_pose, HeadPose};
pub use session::{
    Challenge, ChallengeKind, FrameAssessment, FrameFeatures, LivenessConfig, LivenessSession,
};
pub use texture::laplacian_variance;

/// Landmark set for one detected face, in frame pixel coordinates.
///
/// Eye contours follow the standard 6-point layout: outer corner, two upper
/// lid points, inner corner, two lower lid points. `pose_points` are the six
/// anchors of the anthropometric head model, in this order: nose tip, chin,
/// left eye outer corner, right eye outer corner, left mouth corner, right
/// mouth corner.
#[derive(Debug, Clone, Copy)]
pub struct FaceLandmarks {
    pub left_eye: [(f32, f32); 6],
    pub right_eye: [(f32, f32); 6],
    pub pose_points: [(f32, f32); 6],
}

/// One captured frame worth of liveness input.
#[derive(Debug, Clone)]
pub struct Observation {
    /// `None` when no face was detected in the frame.
    pub landmarks: Option<FaceLandmarks>,
    /// Grayscale crop of the detected face region, for texture analysis.
    pub face_crop: Option<FaceCrop>,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub gray: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// Produces landmarks for the most prominent face in a frame, if any.
///
/// Implementations live outside this crate; the daemon wires one in when a
/// backend is configured and leaves liveness gating off otherwise.
pub trait LandmarkEstimator: Send {
    fn landmarks(&mut self, gray: &[u8], width: u32, height: u32) -> Option<FaceLandmarks>;
}
