//! Presence tracking and the attendance state machine.
//!
//! A scan cycle turns "who the camera recognized just now" into attendance
//! facts: ambient check-ins with the late rule applied, miss warnings, and
//! the single automatic day-closing action (checkout or absence) once the
//! miss ceiling is crossed. Storage sits behind [`store::AttendanceStore`],
//! whose `with_day` contract keeps every (employee, day) mutation atomic.

pub mod attendance;
pub mod presence;
pub mod schedule;
pub mod store;
pub mod tracker;

pub use attendance::{AttendanceError, AttendanceRecord, AttendanceStatus, CheckInMethod};
pub use presence::{PresenceRecord, PresenceStatus};
pub use schedule::{ScheduleBook, WorkSchedule};
pub use store::{AttendanceStore, DayState, MemoryStore, MemoryStoreError};
pub use tracker::{record_sighting, run_scan_cycle, ScanOutcome, ScanSummary, SkipReason, TrackerConfig};
