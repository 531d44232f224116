//! Per-attempt liveness session and challenge state machine.

use crate::ear::average_ear;
use crate::pose::{solve_head_pose, HeadPose};
use crate::texture::laplacian_variance;
use crate::Observation;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const EAR_WINDOW: usize = 30;
const YAW_WINDOW: usize = 30;
const TEXTURE_WINDOW: usize = 10;

/// Samples required before a variance check is meaningful.
const MIN_VARIANCE_SAMPLES: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// EAR below this counts as eyes closed.
    pub ear_threshold: f32,
    /// Consecutive closed frames required before a rise counts as a blink.
    pub blink_consecutive_frames: u32,
    pub texture_floor: f64,
    pub ear_variance_floor: f64,
    pub yaw_variance_floor: f64,
    pub challenge_timeout: Duration,
    /// Yaw magnitude (degrees) that satisfies a turn challenge.
    pub turn_yaw_degrees: f64,
    /// Pitch magnitude (degrees) that satisfies a nod challenge.
    pub nod_pitch_degrees: f64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ear_threshold: 0.21,
            blink_consecutive_frames: 2,
            texture_floor: 50.0,
            ear_variance_floor: 1e-4,
            yaw_variance_floor: 0.1,
            challenge_timeout: Duration::from_secs(10),
            turn_yaw_degrees: 15.0,
            nod_pitch_degrees: 12.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Blink,
    TurnLeft,
    TurnRight,
    Nod,
}

/// Challenge lifecycle. `Completed` and `TimedOut` are terminal until the
/// next [`LivenessSession::start_challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    None,
    Active { kind: ChallengeKind, started: Instant },
    Completed { kind: ChallengeKind },
    TimedOut { kind: ChallengeKind },
}

impl Challenge {
    pub fn is_completed(&self) -> bool {
        matches!(self, Challenge::Completed { .. })
    }
}

/// Signals extracted from one frame, before they touch any history.
///
/// Split out from [`Observation`] handling so the state machine can be
/// driven with synthetic values.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFeatures {
    pub ear: Option<f32>,
    pub pose: Option<HeadPose>,
    pub texture: Option<f64>,
}

impl FrameFeatures {
    /// `None` when the observation carries no face.
    pub fn from_observation(obs: &Observation) -> Option<Self> {
        let landmarks = obs.landmarks.as_ref()?;
        let ear = Some(average_ear(&landmarks.left_eye, &landmarks.right_eye));
        let pose = solve_head_pose(landmarks, obs.frame_width, obs.frame_height);
        let texture = obs
            .face_crop
            .as_ref()
            .map(|crop| laplacian_variance(&crop.gray, crop.width, crop.height));
        Some(Self { ear, pose, texture })
    }
}

/// What one processed frame contributed.
#[derive(Debug, Clone, Copy)]
pub struct FrameAssessment {
    pub face_detected: bool,
    pub ear: Option<f32>,
    pub pose: Option<HeadPose>,
    pub texture: Option<f64>,
    /// A full blink (close, hold, rise) finished on this frame.
    pub blink_registered: bool,
    pub challenge: Challenge,
}

/// Rolling liveness state for one interactive attempt.
///
/// Histories only ever shrink through [`reset`](Self::reset); completing a
/// challenge deliberately leaves them intact so a verdict can follow.
pub struct LivenessSession {
    config: LivenessConfig,
    ear_history: VecDeque<f32>,
    yaw_history: VecDeque<f64>,
    texture_history: VecDeque<f64>,
    closed_streak: u32,
    total_blinks: u32,
    blinks_at_challenge_start: u32,
    challenge: Challenge,
}

impl LivenessSession {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            ear_history: VecDeque::with_capacity(EAR_WINDOW),
            yaw_history: VecDeque::with_capacity(YAW_WINDOW),
            texture_history: VecDeque::with_capacity(TEXTURE_WINDOW),
            closed_streak: 0,
            total_blinks: 0,
            blinks_at_challenge_start: 0,
            challenge: Challenge::None,
        }
    }

    pub fn challenge(&self) -> Challenge {
        self.challenge
    }

    pub fn total_blinks(&self) -> u32 {
        self.total_blinks
    }

    /// Begin a challenge, replacing whatever state the previous one was in.
    pub fn start_challenge(&mut self, kind: ChallengeKind, now: Instant) {
        tracing::debug!(?kind, "challenge started");
        self.blinks_at_challenge_start = self.total_blinks;
        self.challenge = Challenge::Active { kind, started: now };
    }

    /// Full evaluation of one captured observation.
    pub fn evaluate(&mut self, obs: &Observation, now: Instant) -> FrameAssessment {
        match FrameFeatures::from_observation(obs) {
            Some(features) => self.observe(features, now),
            None => {
                // No face: histories stay untouched but the clock still runs.
                self.check_timeout(now);
                FrameAssessment {
                    face_detected: false,
                    ear: None,
                    pose: None,
                    texture: None,
                    blink_registered: false,
                    challenge: self.challenge,
                }
            }
        }
    }

    /// Feed pre-extracted frame features through the state machine.
    pub fn observe(&mut self, features: FrameFeatures, now: Instant) -> FrameAssessment {
        self.check_timeout(now);

        let mut blink_registered = false;
        if let Some(ear) = features.ear {
            push_bounded(&mut self.ear_history, ear, EAR_WINDOW);
            if ear < self.config.ear_threshold {
                self.closed_streak += 1;
            } else {
                if self.closed_streak >= self.config.blink_consecutive_frames {
                    self.total_blinks += 1;
                    blink_registered = true;
                    tracing::trace!(total = self.total_blinks, "blink registered");
                }
                self.closed_streak = 0;
            }
        }

        if let Some(pose) = features.pose {
            push_bounded(&mut self.yaw_history, pose.yaw, YAW_WINDOW);
        }
        if let Some(texture) = features.texture {
            push_bounded(&mut self.texture_history, texture, TEXTURE_WINDOW);
        }

        self.advance_challenge(&features);

        FrameAssessment {
            face_detected: true,
            ear: features.ear,
            pose: features.pose,
            texture: features.texture,
            blink_registered,
            challenge: self.challenge,
        }
    }

    /// Passive verdict: at least two of the three signals look alive.
    pub fn is_live(&self) -> bool {
        let mut passes = 0;

        if let Some(mean) = mean_of(self.texture_history.iter().copied()) {
            if mean > self.config.texture_floor {
                passes += 1;
            }
        }
        if self.ear_history.len() >= MIN_VARIANCE_SAMPLES {
            let var = variance_of(self.ear_history.iter().map(|&v| v as f64));
            if var > self.config.ear_variance_floor {
                passes += 1;
            }
        }
        if self.yaw_history.len() >= MIN_VARIANCE_SAMPLES
            && variance_of(self.yaw_history.iter().copied()) > self.config.yaw_variance_floor
        {
            passes += 1;
        }

        passes >= 2
    }

    /// Drop all histories, counters, and challenge state.
    pub fn reset(&mut self) {
        self.ear_history.clear();
        self.yaw_history.clear();
        self.texture_history.clear();
        self.closed_streak = 0;
        self.total_blinks = 0;
        self.blinks_at_challenge_start = 0;
        self.challenge = Challenge::None;
    }

    fn check_timeout(&mut self, now: Instant) {
        if let Challenge::Active { kind, started } = self.challenge {
            if now.duration_since(started) >= self.config.challenge_timeout {
                tracing::info!(?kind, "challenge timed out");
                self.challenge = Challenge::TimedOut { kind };
            }
        }
    }

    fn advance_challenge(&mut self, features: &FrameFeatures) {
        let Challenge::Active { kind, .. } = self.challenge else {
            return;
        };

        let satisfied = match kind {
            // Completes on the eyes-closed frame itself, or on any full
            // blink counted since the challenge started.
            ChallengeKind::Blink => {
                features
                    .ear
                    .map_or(false, |ear| ear < self.config.ear_threshold)
                    || self.total_blinks > self.blinks_at_challenge_start
            }
            ChallengeKind::TurnLeft => features
                .pose
                .map_or(false, |p| p.yaw > self.config.turn_yaw_degrees),
            ChallengeKind::TurnRight => features
                .pose
                .map_or(false, |p| p.yaw < -self.config.turn_yaw_degrees),
            ChallengeKind::Nod => features
                .pose
                .map_or(false, |p| p.pitch.abs() > self.config.nod_pitch_degrees),
        };

        if satisfied {
            tracing::info!(?kind, "challenge completed");
            self.challenge = Challenge::Completed { kind };
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(value);
}

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

fn variance_of(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let Some(mean) = mean_of(values.clone()) else {
        return 0.0;
    };
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += (v - mean) * (v - mean);
        n += 1;
    }
    sum / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> LivenessSession {
        LivenessSession::new(LivenessConfig::default())
    }

    fn open_frame() -> FrameFeatures {
        FrameFeatures {
            ear: Some(0.30),
            pose: Some(HeadPose {
                yaw: 0.0,
                pitch: 0.0,
                roll: 0.0,
            }),
            texture: Some(120.0),
        }
    }

    fn closed_frame() -> FrameFeatures {
        FrameFeatures {
            ear: Some(0.10),
            ..open_frame()
        }
    }

    fn pose_frame(yaw: f64, pitch: f64) -> FrameFeatures {
        FrameFeatures {
            pose: Some(HeadPose {
                yaw,
                pitch,
                roll: 0.0,
            }),
            ..open_frame()
        }
    }

    #[test]
    fn test_full_blink_registers_once() {
        let mut s = session();
        let t = Instant::now();
        let mut registered = 0;
        for f in [
            open_frame(),
            open_frame(),
            closed_frame(),
            closed_frame(),
            open_frame(),
            open_frame(),
        ] {
            if s.observe(f, t).blink_registered {
                registered += 1;
            }
        }
        assert_eq!(registered, 1);
        assert_eq!(s.total_blinks(), 1);
    }

    #[test]
    fn test_single_frame_dip_is_not_a_blink() {
        let mut s = session();
        let t = Instant::now();
        for f in [open_frame(), closed_frame(), open_frame()] {
            s.observe(f, t);
        }
        assert_eq!(s.total_blinks(), 0);
    }

    #[test]
    fn test_blink_challenge_completes_on_closing_frame() {
        let mut s = session();
        let t = Instant::now();
        s.start_challenge(ChallengeKind::Blink, t);
        s.observe(open_frame(), t);
        assert!(matches!(s.challenge(), Challenge::Active { .. }));

        // The first eyes-closed frame completes it, before any rise.
        let a = s.observe(closed_frame(), t);
        assert!(a.challenge.is_completed());
    }

    #[test]
    fn test_blink_before_challenge_does_not_count() {
        let mut s = session();
        let t = Instant::now();
        for f in [closed_frame(), closed_frame(), open_frame()] {
            s.observe(f, t);
        }
        assert_eq!(s.total_blinks(), 1);

        s.start_challenge(ChallengeKind::Blink, t);
        let a = s.observe(open_frame(), t);
        assert!(matches!(a.challenge, Challenge::Active { .. }));
    }

    #[test]
    fn test_turn_challenges_use_signed_yaw() {
        let t = Instant::now();

        let mut s = session();
        s.start_challenge(ChallengeKind::TurnLeft, t);
        assert!(matches!(
            s.observe(pose_frame(-20.0, 0.0), t).challenge,
            Challenge::Active { .. }
        ));
        assert!(s.observe(pose_frame(20.0, 0.0), t).challenge.is_completed());

        let mut s = session();
        s.start_challenge(ChallengeKind::TurnRight, t);
        assert!(matches!(
            s.observe(pose_frame(20.0, 0.0), t).challenge,
            Challenge::Active { .. }
        ));
        assert!(s
            .observe(pose_frame(-20.0, 0.0), t)
            .challenge
            .is_completed());
    }

    #[test]
    fn test_nod_challenge_accepts_either_direction() {
        let t = Instant::now();
        for pitch in [15.0, -15.0] {
            let mut s = session();
            s.start_challenge(ChallengeKind::Nod, t);
            assert!(s.observe(pose_frame(0.0, pitch), t).challenge.is_completed());
        }
    }

    #[test]
    fn test_challenge_times_out_after_deadline() {
        let mut s = session();
        let t = Instant::now();
        s.start_challenge(ChallengeKind::TurnLeft, t);
        s.observe(open_frame(), t + Duration::from_secs(5));
        assert!(matches!(s.challenge(), Challenge::Active { .. }));

        let a = s.observe(open_frame(), t + Duration::from_secs(10));
        assert!(matches!(a.challenge, Challenge::TimedOut { .. }));

        // Satisfying motion after the deadline changes nothing.
        let a = s.observe(pose_frame(25.0, 0.0), t + Duration::from_secs(11));
        assert!(matches!(a.challenge, Challenge::TimedOut { .. }));
    }

    #[test]
    fn test_no_face_frame_still_times_out_challenge() {
        let mut s = session();
        let t = Instant::now();
        s.start_challenge(ChallengeKind::Blink, t);

        let obs = Observation {
            landmarks: None,
            face_crop: None,
            frame_width: 640,
            frame_height: 480,
        };
        let a = s.evaluate(&obs, t + Duration::from_secs(12));
        assert!(!a.face_detected);
        assert!(matches!(a.challenge, Challenge::TimedOut { .. }));
        assert_eq!(s.ear_history.len(), 0);
    }

    #[test]
    fn test_is_live_needs_two_signals() {
        let t = Instant::now();

        // Varied EAR and yaw, decent texture: alive.
        let mut s = session();
        for i in 0..10 {
            let f = FrameFeatures {
                ear: Some(0.25 + 0.03 * (i % 3) as f32),
                pose: Some(HeadPose {
                    yaw: (i % 4) as f64,
                    pitch: 0.0,
                    roll: 0.0,
                }),
                texture: Some(150.0),
            };
            s.observe(f, t);
        }
        assert!(s.is_live());

        // Frozen EAR, frozen yaw, flat texture: a photo.
        let mut s = session();
        for _ in 0..10 {
            let f = FrameFeatures {
                ear: Some(0.28),
                pose: Some(HeadPose {
                    yaw: 3.0,
                    pitch: 0.0,
                    roll: 0.0,
                }),
                texture: Some(10.0),
            };
            s.observe(f, t);
        }
        assert!(!s.is_live());
    }

    #[test]
    fn test_too_few_samples_not_live() {
        let mut s = session();
        let t = Instant::now();
        s.observe(open_frame(), t);
        s.observe(closed_frame(), t);
        // Texture alone is one signal; variance checks need more history.
        assert!(!s.is_live());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut s = session();
        let t = Instant::now();
        s.start_challenge(ChallengeKind::Blink, t);
        for f in [closed_frame(), closed_frame(), open_frame()] {
            s.observe(f, t);
        }
        assert_eq!(s.total_blinks(), 1);

        s.reset();
        assert_eq!(s.total_blinks(), 0);
        assert_eq!(s.challenge(), Challenge::None);
        assert!(s.ear_history.is_empty());
        assert!(s.yaw_history.is_empty());
        assert!(s.texture_history.is_empty());
    }

    #[test]
    fn test_completion_preserves_histories() {
        let mut s = session();
        let t = Instant::now();
        for _ in 0..8 {
            s.observe(open_frame(), t);
        }
        let before = s.ear_history.len();
        s.start_challenge(ChallengeKind::Nod, t);
        s.observe(pose_frame(0.0, 20.0), t);
        assert!(s.challenge().is_completed());
        assert_eq!(s.ear_history.len(), before + 1);
    }
}
