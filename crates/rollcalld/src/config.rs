use chrono::NaiveTime;
use rollcall_track::WorkSchedule;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SeetaFace cascade model file.
    pub detector_model: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Raw-score acceptance threshold for the identifying path.
    pub strict_threshold: f64,
    /// Raw-score acceptance threshold for the confirmatory path.
    pub lenient_threshold: f64,
    /// Smallest face edge (pixels) the detector will report.
    pub min_face_size: u32,
    /// Detector cascade score threshold.
    pub detector_score_threshold: f64,
    /// Consecutive scan misses before the day is closed automatically.
    pub miss_ceiling: u32,
    /// Seconds between ambient check-in attempts for the same employee.
    pub cooldown_secs: u64,
    /// Default working hours and grace period.
    pub schedule: WorkSchedule,
    /// Frames sampled per scan operation.
    pub scan_frames: usize,
    /// Seconds over which scan frames are spread.
    pub scan_window_secs: u64,
    /// Ambient loop runs identification on every Nth frame.
    pub process_every: u32,
    /// Consecutive camera failures before the ambient loop gives up.
    pub max_consecutive_failures: u32,
    /// Whether the ambient recognition loop starts at all.
    pub ambient_enabled: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let detector_model = std::env::var("ROLLCALL_DETECTOR_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("seeta_fd_frontal_v1.0.bin"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            detector_model,
            db_path,
            strict_threshold: env_f64("ROLLCALL_STRICT_THRESHOLD", 65.0),
            lenient_threshold: env_f64("ROLLCALL_LENIENT_THRESHOLD", 85.0),
            min_face_size: env_u64("ROLLCALL_MIN_FACE_SIZE", 60) as u32,
            detector_score_threshold: env_f64("ROLLCALL_DETECTOR_SCORE_THRESHOLD", 2.5),
            miss_ceiling: env_u64("ROLLCALL_MISS_CEILING", 3) as u32,
            cooldown_secs: env_u64("ROLLCALL_COOLDOWN_SECS", 300),
            schedule: WorkSchedule {
                check_in: env_time("ROLLCALL_CHECK_IN_TIME", NaiveTime::from_hms_opt(9, 0, 0)),
                check_out: env_time("ROLLCALL_CHECK_OUT_TIME", NaiveTime::from_hms_opt(18, 0, 0)),
                grace_minutes: env_u64("ROLLCALL_GRACE_MINUTES", 15) as i64,
            },
            scan_frames: env_usize("ROLLCALL_SCAN_FRAMES", 5),
            scan_window_secs: env_u64("ROLLCALL_SCAN_WINDOW_SECS", 2),
            process_every: env_u64("ROLLCALL_PROCESS_EVERY", 2) as u32,
            max_consecutive_failures: env_u64("ROLLCALL_MAX_CAMERA_FAILURES", 30) as u32,
            ambient_enabled: std::env::var("ROLLCALL_AMBIENT_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(true),
        }
    }

    pub fn detector_model_path(&self) -> String {
        self.detector_model.to_string_lossy().into_owned()
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_time(key: &str, default: Option<NaiveTime>) -> NaiveTime {
    std::env::var(key)
        .ok()
        .and_then(|v| NaiveTime::parse_from_str(&v, "%H:%M").ok())
        .or(default)
        .unwrap_or_default()
}
