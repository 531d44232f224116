//! Continuous ambient recognition loop.
//!
//! Reads frames on a dedicated thread, identifies every Nth one through the
//! engine, and records sightings with a per-employee cooldown. Camera and
//! recognition failures are logged, never propagated; only the bounded
//! consecutive-failure ceiling or the stop flag ends the loop.

use crate::engine::{EngineError, EngineHandle};
use crate::store_sqlite::SqliteStore;
use chrono::Local;
use rollcall_core::{EmployeeId, IdentifyOutcome};
use rollcall_hw::SharedCamera;
use rollcall_track::{record_sighting, AttendanceStore, ScanOutcome, ScheduleBook};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pause between frame reads; keeps the loop near camera frame rate
/// without spinning when reads return instantly.
const FRAME_PAUSE: Duration = Duration::from_millis(100);
/// Back-off after a failed camera read.
const FAILURE_PAUSE: Duration = Duration::from_millis(500);

pub struct AmbientConfig {
    pub process_every: u32,
    pub cooldown: Duration,
    pub max_consecutive_failures: u32,
}

/// Per-employee rate limit on ambient sighting records.
///
/// One recognition burst can match the same person many times in a row;
/// only the first sighting inside each cooldown interval reaches the store.
struct CooldownGate {
    interval: Duration,
    last_admitted: HashMap<EmployeeId, Instant>,
}

impl CooldownGate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_admitted: HashMap::new(),
        }
    }

    /// True when this employee's cooldown has elapsed; admitting restamps
    /// the clock, so the interval is measured between admitted sightings.
    fn admit(&mut self, employee: EmployeeId, now: Instant) -> bool {
        if let Some(previous) = self.last_admitted.get(&employee) {
            if now.duration_since(*previous) < self.interval {
                return false;
            }
        }
        self.last_admitted.insert(employee, now);
        true
    }
}

/// Handle to the running loop; dropping it does not stop the thread.
pub struct AmbientLoop {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AmbientLoop {
    /// Signal the loop to stop and wait for it to release the camera.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn spawn_ambient_loop(
    engine: EngineHandle,
    camera: SharedCamera,
    store: Arc<SqliteStore>,
    schedules: ScheduleBook,
    config: AmbientConfig,
) -> AmbientLoop {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = std::thread::Builder::new()
        .name("rollcall-ambient".into())
        .spawn(move || {
            run_loop(&engine, &camera, &store, &schedules, &config, &stop_flag);
            camera.release();
            tracing::info!("ambient loop stopped");
        })
        .expect("failed to spawn ambient loop thread");

    AmbientLoop {
        stop,
        thread: Some(thread),
    }
}

fn run_loop(
    engine: &EngineHandle,
    camera: &SharedCamera,
    store: &SqliteStore,
    schedules: &ScheduleBook,
    config: &AmbientConfig,
    stop: &AtomicBool,
) {
    let mut consecutive_failures = 0u32;
    let mut frame_counter = 0u64;
    let mut cooldowns = CooldownGate::new(config.cooldown);
    let process_every = config.process_every.max(1) as u64;

    tracing::info!(
        process_every,
        cooldown_secs = config.cooldown.as_secs(),
        "ambient loop started"
    );

    while !stop.load(Ordering::Relaxed) {
        let frame = match camera.with_camera(|camera| camera.capture_frame()) {
            Ok(frame) => {
                consecutive_failures = 0;
                frame
            }
            Err(err) => {
                consecutive_failures += 1;
                tracing::warn!(%err, consecutive_failures, "ambient frame read failed");
                if consecutive_failures >= config.max_consecutive_failures {
                    tracing::error!(
                        limit = config.max_consecutive_failures,
                        "too many consecutive camera failures; ambient loop giving up"
                    );
                    break;
                }
                std::thread::sleep(FAILURE_PAUSE);
                continue;
            }
        };

        frame_counter += 1;
        if frame_counter % process_every != 0 {
            continue;
        }

        match engine.identify_blocking(frame.data, frame.width, frame.height) {
            Ok(IdentifyOutcome::Scored(result)) => {
                if let Some(employee) = result.employee {
                    if cooldowns.admit(employee, Instant::now()) {
                        handle_sighting(store, schedules, employee);
                    }
                }
            }
            Ok(IdentifyOutcome::Rejected(_)) => {}
            Err(EngineError::ChannelClosed) => {
                tracing::info!("engine gone; ambient loop exiting");
                break;
            }
            Err(err) => {
                tracing::warn!(%err, "ambient identification failed");
            }
        }

        std::thread::sleep(FRAME_PAUSE);
    }
}

fn handle_sighting(store: &SqliteStore, schedules: &ScheduleBook, employee: EmployeeId) {
    let wall = Local::now().naive_local();
    let schedule = *schedules.for_employee(employee);
    let mut sighting = ScanOutcome::Seen;
    let recorded = store.with_day(employee, wall.date(), &mut |day| {
        sighting = record_sighting(day, wall, &schedule);
    });

    match recorded {
        Ok(()) => {
            if let ScanOutcome::CheckedIn { status } = sighting {
                tracing::info!(employee, ?status, "ambient check-in");
            } else {
                tracing::debug!(employee, "ambient sighting");
            }
        }
        Err(err) => tracing::error!(employee, %err, "failed to record sighting"),
    }
}
