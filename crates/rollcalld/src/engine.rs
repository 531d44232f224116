//! Engine thread: all recognition, liveness, and attendance mutation runs
//! here, serialized over an mpsc request loop with oneshot replies.

use crate::config::Config;
use crate::store_sqlite::{SqliteStore, StoreError};
use chrono::Local;
use rollcall_core::{
    BuildReport, ConfirmOutcome, DetectorConfig, DetectorError, EmployeeId, FrameRejection,
    IdentifyOutcome, MatchEngine, SeetaDetector, TemplateStore, Thresholds,
};
use rollcall_hw::{CameraError, SharedCamera};
use rollcall_liveness::{
    Challenge, ChallengeKind, FaceCrop, LandmarkEstimator, LivenessConfig, LivenessSession,
    Observation,
};
use rollcall_track::{
    record_sighting, run_scan_cycle, AttendanceStatus, AttendanceStore, DayState, ScanOutcome,
    ScanSummary, ScheduleBook, TrackerConfig,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("could not decode submitted image: {0}")]
    UndecodableImage(String),
    #[error("no landmark backend configured; liveness unavailable")]
    LivenessUnavailable,
    #[error("liveness challenge not completed")]
    LivenessRequired,
    #[error("unknown challenge kind: {0}")]
    UnknownChallenge(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Reply for the confirmatory check-in path.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmReply {
    #[serde(flatten)]
    pub outcome: ConfirmOutcome,
    pub checked_in: bool,
    pub attendance_status: Option<AttendanceStatus>,
}

/// Reply for one submitted challenge frame.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeReply {
    pub face_detected: bool,
    pub challenge: String,
    pub blink_registered: bool,
    pub is_live: bool,
}

/// Reply for the enrollment path. A successful enrollment triggers an
/// immediate rebuild, so `build` reflects the new template set.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollReply {
    Enrolled {
        employee: EmployeeId,
        build: BuildReport,
    },
    NoFace,
    MultipleFaces,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: String,
    pub trained: bool,
    pub camera_open: bool,
    pub liveness_available: bool,
    pub enrolled: usize,
}

enum EngineRequest {
    Rebuild {
        reply: oneshot::Sender<Result<BuildReport, EngineError>>,
    },
    AddEmployee {
        code: String,
        name: String,
        reply: oneshot::Sender<Result<EmployeeId, EngineError>>,
    },
    Deactivate {
        employee: EmployeeId,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Enroll {
        employee: EmployeeId,
        image: Vec<u8>,
        make_primary: bool,
        reply: oneshot::Sender<Result<EnrollReply, EngineError>>,
    },
    Identify {
        frame: Vec<u8>,
        width: u32,
        height: u32,
        reply: oneshot::Sender<IdentifyOutcome>,
    },
    Confirm {
        employee: EmployeeId,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<ConfirmReply, EngineError>>,
    },
    StartChallenge {
        kind: ChallengeKind,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ChallengeFrame {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<ChallengeReply, EngineError>>,
    },
    Scan {
        reply: oneshot::Sender<Result<ScanSummary, EngineError>>,
    },
    Snapshot {
        employee: EmployeeId,
        reply: oneshot::Sender<Result<Option<DayState>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    ResetPresence {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn rebuild(&self) -> Result<BuildReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Rebuild { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn add_employee(&self, code: String, name: String) -> Result<EmployeeId, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::AddEmployee {
                code,
                name,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn deactivate(&self, employee: EmployeeId) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Deactivate {
                employee,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn enroll(
        &self,
        employee: EmployeeId,
        image: Vec<u8>,
        make_primary: bool,
    ) -> Result<EnrollReply, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                employee,
                image,
                make_primary,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn confirm(
        &self,
        employee: EmployeeId,
        image: Vec<u8>,
    ) -> Result<ConfirmReply, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Confirm {
                employee,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn start_challenge(&self, kind: ChallengeKind) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::StartChallenge {
                kind,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn challenge_frame(&self, image: Vec<u8>) -> Result<ChallengeReply, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ChallengeFrame {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn scan(&self) -> Result<ScanSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Scan { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn snapshot(&self, employee: EmployeeId) -> Result<Option<DayState>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snapshot {
                employee,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn reset_presence(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ResetPresence { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Synchronous identify for the ambient capture thread.
    pub fn identify_blocking(
        &self,
        frame: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<IdentifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(EngineRequest::Identify {
                frame,
                width,
                height,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::ChannelClosed)
    }
}

pub fn parse_challenge_kind(value: &str) -> Result<ChallengeKind, EngineError> {
    match value {
        "blink" => Ok(ChallengeKind::Blink),
        "turn_left" => Ok(ChallengeKind::TurnLeft),
        "turn_right" => Ok(ChallengeKind::TurnRight),
        "nod" => Ok(ChallengeKind::Nod),
        other => Err(EngineError::UnknownChallenge(other.to_string())),
    }
}

struct Engine {
    matcher: MatchEngine,
    store: Arc<SqliteStore>,
    camera: SharedCamera,
    schedules: ScheduleBook,
    session: LivenessSession,
    estimator: Option<Box<dyn LandmarkEstimator>>,
    tracker: TrackerConfig,
    scan_frames: usize,
    scan_interval: Duration,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the detector cascade synchronously (fail-fast) and performs the
/// initial model build from whatever templates the store holds.
pub fn spawn_engine(
    config: &Config,
    store: Arc<SqliteStore>,
    camera: SharedCamera,
    estimator: Option<Box<dyn LandmarkEstimator>>,
) -> Result<EngineHandle, EngineError> {
    let detector = SeetaDetector::load(
        &config.detector_model_path(),
        DetectorConfig {
            min_face_size: config.min_face_size,
            score_threshold: config.detector_score_threshold,
        },
    )?;

    let matcher = MatchEngine::new(
        Box::new(detector),
        Thresholds {
            strict: config.strict_threshold,
            lenient: config.lenient_threshold,
        },
    );

    let schedules = store.schedule_book(config.schedule)?;
    let scan_interval = if config.scan_frames > 1 {
        Duration::from_millis(
            config.scan_window_secs * 1000 / (config.scan_frames as u64 - 1),
        )
    } else {
        Duration::ZERO
    };

    if estimator.is_none() {
        tracing::warn!("no landmark backend configured; running without liveness gating");
    }

    let mut engine = Engine {
        matcher,
        store,
        camera,
        schedules,
        session: LivenessSession::new(LivenessConfig::default()),
        estimator,
        tracker: TrackerConfig {
            miss_ceiling: config.miss_ceiling,
        },
        scan_frames: config.scan_frames,
        scan_interval,
    };

    let report = engine.rebuild()?;
    tracing::info!(
        trained = report.trained,
        templates = report.templates,
        identities = report.identities,
        "initial model build"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.dispatch(req);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

impl Engine {
    fn dispatch(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Rebuild { reply } => {
                let _ = reply.send(self.rebuild());
            }
            EngineRequest::AddEmployee { code, name, reply } => {
                let _ = reply.send(self.add_employee(&code, &name));
            }
            EngineRequest::Deactivate { employee, reply } => {
                let _ = reply.send(self.deactivate(employee));
            }
            EngineRequest::Enroll {
                employee,
                image,
                make_primary,
                reply,
            } => {
                let _ = reply.send(self.enroll(employee, &image, make_primary));
            }
            EngineRequest::Identify {
                frame,
                width,
                height,
                reply,
            } => {
                let _ = reply.send(self.matcher.identify(&frame, width, height));
            }
            EngineRequest::Confirm {
                employee,
                image,
                reply,
            } => {
                let _ = reply.send(self.confirm(employee, &image));
            }
            EngineRequest::StartChallenge { kind, reply } => {
                let _ = reply.send(self.start_challenge(kind));
            }
            EngineRequest::ChallengeFrame { image, reply } => {
                let _ = reply.send(self.challenge_frame(&image));
            }
            EngineRequest::Scan { reply } => {
                let _ = reply.send(self.scan());
            }
            EngineRequest::Snapshot { employee, reply } => {
                let today = Local::now().date_naive();
                let _ = reply.send(self.store.day(employee, today).map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::ResetPresence { reply } => {
                let today = Local::now().date_naive();
                let _ = reply.send(
                    self.store
                        .reset_presence(today)
                        .map_err(EngineError::from),
                );
            }
        }
    }

    fn rebuild(&mut self) -> Result<BuildReport, EngineError> {
        let templates = self.store.templates()?;
        Ok(self.matcher.rebuild(&templates))
    }

    fn add_employee(&mut self, code: &str, name: &str) -> Result<EmployeeId, EngineError> {
        let id = self.store.insert_employee(code, name, None)?;
        tracing::info!(employee = id, code, name, "employee registered");
        Ok(id)
    }

    /// Deactivation drops the employee's templates from the roster queries,
    /// so a rebuild immediately retires their identity from the matcher.
    fn deactivate(&mut self, employee: EmployeeId) -> Result<bool, EngineError> {
        let changed = self.store.deactivate_employee(employee)?;
        if changed {
            tracing::info!(employee, "employee deactivated");
            self.rebuild()?;
        }
        Ok(changed)
    }

    fn enroll(
        &mut self,
        employee: EmployeeId,
        image: &[u8],
        make_primary: bool,
    ) -> Result<EnrollReply, EngineError> {
        let (gray, width, height) = decode_grayscale(image)?;
        enroll_template(
            &mut self.matcher,
            &self.store,
            employee,
            &gray,
            width,
            height,
            make_primary,
        )
    }

    fn confirm(&mut self, employee: EmployeeId, image: &[u8]) -> Result<ConfirmReply, EngineError> {
        // Liveness is only enforceable with a landmark backend; without one
        // the confirmatory path degrades to recognition alone.
        if self.estimator.is_some() && !self.session.challenge().is_completed() {
            return Err(EngineError::LivenessRequired);
        }

        let (gray, width, height) = decode_grayscale(image)?;
        let outcome = self.matcher.confirm(&gray, width, height, employee);

        let mut checked_in = false;
        let mut attendance_status = None;
        if matches!(outcome, ConfirmOutcome::Confirmed { .. }) {
            let now = Local::now().naive_local();
            let schedule = *self.schedules.for_employee(employee);
            let mut sighting = ScanOutcome::Seen;
            self.store.with_day(employee, now.date(), &mut |day| {
                sighting = record_sighting(day, now, &schedule);
                // record_sighting stamps Ambient; this check-in was the
                // employee acting for themselves.
                if matches!(sighting, ScanOutcome::CheckedIn { .. }) {
                    day.attendance.method = Some(rollcall_track::CheckInMethod::SelfService);
                }
            })?;
            if let ScanOutcome::CheckedIn { status } = sighting {
                checked_in = true;
                attendance_status = Some(status);
                tracing::info!(employee, ?status, "self-service check-in confirmed");
            }
            // A completed challenge is good for exactly one confirmation.
            self.session.reset();
        }

        Ok(ConfirmReply {
            outcome,
            checked_in,
            attendance_status,
        })
    }

    fn start_challenge(&mut self, kind: ChallengeKind) -> Result<(), EngineError> {
        if self.estimator.is_none() {
            return Err(EngineError::LivenessUnavailable);
        }
        self.session.start_challenge(kind, Instant::now());
        Ok(())
    }

    fn challenge_frame(&mut self, image: &[u8]) -> Result<ChallengeReply, EngineError> {
        let estimator = self
            .estimator
            .as_mut()
            .ok_or(EngineError::LivenessUnavailable)?;

        let (gray, width, height) = decode_grayscale(image)?;
        let landmarks = estimator.landmarks(&gray, width, height);
        let observation = Observation {
            landmarks,
            face_crop: landmarks.map(|_| FaceCrop {
                gray: gray.clone(),
                width: width as usize,
                height: height as usize,
            }),
            frame_width: width,
            frame_height: height,
        };

        let assessment = self.session.evaluate(&observation, Instant::now());
        Ok(ChallengeReply {
            face_detected: assessment.face_detected,
            challenge: challenge_label(assessment.challenge),
            blink_registered: assessment.blink_registered,
            is_live: self.session.is_live(),
        })
    }

    fn scan(&mut self) -> Result<ScanSummary, EngineError> {
        let frames = self
            .camera
            .with_camera(|camera| camera.capture_frames(self.scan_frames, self.scan_interval))?;

        let mut recognized: HashSet<EmployeeId> = HashSet::new();
        for frame in &frames {
            if let IdentifyOutcome::Scored(result) =
                self.matcher.identify(&frame.data, frame.width, frame.height)
            {
                if let Some(id) = result.employee {
                    recognized.insert(id);
                }
            }
        }

        let roster = self.store.roster()?;
        let now = Local::now().naive_local();
        let summary = run_scan_cycle(
            self.store.as_ref(),
            &roster,
            &recognized,
            now,
            &self.schedules,
            self.tracker,
        )?;
        tracing::info!(
            scanned = summary.scanned,
            recognized = summary.recognized,
            checked_in = summary.checked_in.len(),
            warned = summary.warned.len(),
            "scan cycle complete"
        );
        Ok(summary)
    }

    fn status(&self) -> EngineStatus {
        let enrolled = self.store.roster().map(|r| r.len()).unwrap_or(0);
        EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            trained: self.matcher.is_trained(),
            camera_open: self.camera.is_open(),
            liveness_available: self.estimator.is_some(),
            enrolled,
        }
    }
}

/// Extract, store, and retrain from one enrollment snapshot.
///
/// The raw resized crop is what gets persisted; the matcher's build step
/// applies the shared normalization pipeline to stored templates and probes
/// alike.
fn enroll_template(
    matcher: &mut MatchEngine,
    store: &SqliteStore,
    employee: EmployeeId,
    gray: &[u8],
    width: u32,
    height: u32,
    make_primary: bool,
) -> Result<EnrollReply, EngineError> {
    let template = match matcher.extract_template(gray, width, height) {
        Ok(template) => template,
        Err(FrameRejection::NoFace) => return Ok(EnrollReply::NoFace),
        Err(FrameRejection::MultipleFaces) => return Ok(EnrollReply::MultipleFaces),
    };

    store.insert_template(employee, &template, make_primary)?;
    let build = matcher.rebuild(&store.templates()?);
    tracing::info!(
        employee,
        make_primary,
        identities = build.identities,
        "template enrolled"
    );
    Ok(EnrollReply::Enrolled { employee, build })
}

fn challenge_label(challenge: Challenge) -> String {
    match challenge {
        Challenge::None => "none".to_string(),
        Challenge::Active { kind, .. } => format!("active:{}", kind_label(kind)),
        Challenge::Completed { kind } => format!("completed:{}", kind_label(kind)),
        Challenge::TimedOut { kind } => format!("timed_out:{}", kind_label(kind)),
    }
}

fn kind_label(kind: ChallengeKind) -> &'static str {
    match kind {
        ChallengeKind::Blink => "blink",
        ChallengeKind::TurnLeft => "turn_left",
        ChallengeKind::TurnRight => "turn_right",
        ChallengeKind::Nod => "nod",
    }
}

/// Decode a submitted image (any format the `image` crate knows) to
/// grayscale. Undecodable bytes are an input-quality rejection.
fn decode_grayscale(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), EngineError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| EngineError::UndecodableImage(e.to_string()))?;
    let gray = decoded.to_luma8();
    let (width, height) = gray.dimensions();
    Ok((gray.into_raw(), width, height))
}
