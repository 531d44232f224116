//! Scan-cycle presence tracking and its automatic attendance actions.
//!
//! One cycle compares the set of recognized employees against the active
//! roster and advances every per-day record exactly once. Automatic actions
//! never throw: each employee yields a tagged outcome the orchestrator logs.

use crate::attendance::{AttendanceStatus, CheckInMethod};
use crate::schedule::ScheduleBook;
use crate::store::{AttendanceStore, DayState};
use chrono::NaiveDateTime;
use rollcall_core::{EmployeeId, EmployeeInfo};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Consecutive misses at which the day is closed out automatically.
    pub miss_ceiling: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { miss_ceiling: 3 }
    }
}

/// What one scan cycle did for one employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Seen for the first time today; ambient check-in recorded.
    CheckedIn { status: AttendanceStatus },
    /// Seen again; miss counter reset.
    Seen,
    /// Missed, but below the ceiling.
    Warned { misses: u32 },
    /// Third consecutive miss with an open check-in.
    AutoCheckedOut { work_minutes: i64 },
    /// Third consecutive miss with no check-in today.
    MarkedAbsent,
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An automatic action already closed this day.
    DayTerminal,
    /// The employee checked out through a non-automatic path earlier.
    ManuallyCheckedOut,
}

/// Aggregate view of one scan cycle, shaped for the control surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub recognized: usize,
    /// Everyone seen this cycle, first sighting or not.
    pub present: Vec<String>,
    pub checked_in: Vec<String>,
    pub warned: Vec<String>,
    pub marked_absent: Vec<String>,
    pub auto_checked_out: Vec<String>,
}

/// Advance every rostered employee's day records by one scan cycle.
pub fn run_scan_cycle<S: AttendanceStore>(
    store: &S,
    roster: &[EmployeeInfo],
    recognized: &HashSet<EmployeeId>,
    now: NaiveDateTime,
    schedules: &ScheduleBook,
    config: TrackerConfig,
) -> Result<ScanSummary, S::Error> {
    let date = now.date();
    let mut summary = ScanSummary {
        scanned: roster.len(),
        recognized: recognized.len(),
        ..ScanSummary::default()
    };

    for employee in roster {
        let seen = recognized.contains(&employee.id);
        let schedule = *schedules.for_employee(employee.id);
        let mut outcome = ScanOutcome::Seen;
        store.with_day(employee.id, date, &mut |day| {
            outcome = advance_day(day, seen, now, &schedule, config);
        })?;

        match &outcome {
            ScanOutcome::CheckedIn { status } => {
                tracing::info!(
                    employee = employee.id,
                    name = %employee.name,
                    ?status,
                    "ambient check-in"
                );
                summary.present.push(employee.name.clone());
                summary.checked_in.push(employee.name.clone());
            }
            ScanOutcome::Seen => {
                summary.present.push(employee.name.clone());
            }
            ScanOutcome::Warned { misses } => {
                tracing::info!(
                    employee = employee.id,
                    name = %employee.name,
                    misses,
                    "employee missing from scan"
                );
                summary.warned.push(employee.name.clone());
            }
            ScanOutcome::AutoCheckedOut { work_minutes } => {
                tracing::warn!(
                    employee = employee.id,
                    name = %employee.name,
                    work_minutes,
                    "auto checkout after repeated misses"
                );
                summary.auto_checked_out.push(employee.name.clone());
            }
            ScanOutcome::MarkedAbsent => {
                tracing::warn!(
                    employee = employee.id,
                    name = %employee.name,
                    "marked absent after repeated misses"
                );
                summary.marked_absent.push(employee.name.clone());
            }
            ScanOutcome::Skipped { reason } => {
                tracing::debug!(employee = employee.id, ?reason, "scan miss skipped");
            }
        }
    }

    Ok(summary)
}

/// A single positive sighting: presence refresh plus a first-of-day
/// ambient check-in when there is none. Shared by the scan cycle and the
/// continuous recognition loop.
pub fn record_sighting(
    day: &mut DayState,
    now: NaiveDateTime,
    schedule: &crate::schedule::WorkSchedule,
) -> ScanOutcome {
    day.presence.mark_seen(now);
    if day.attendance.check_in.is_none() {
        return match day
            .attendance
            .record_check_in(now, schedule, CheckInMethod::Ambient)
        {
            Ok(status) => ScanOutcome::CheckedIn { status },
            // check_in was None, so the only failure mode is unreachable;
            // treat it as an ordinary sighting rather than poisoning the cycle.
            Err(_) => ScanOutcome::Seen,
        };
    }
    ScanOutcome::Seen
}

/// One employee, one cycle. All the transition rules live here.
fn advance_day(
    day: &mut DayState,
    seen: bool,
    now: NaiveDateTime,
    schedule: &crate::schedule::WorkSchedule,
    config: TrackerConfig,
) -> ScanOutcome {
    if seen {
        return record_sighting(day, now, schedule);
    }

    // Terminal days freeze the miss path: no counter movement, no stamps.
    // A positive sighting above still lands normally.
    if day.presence.is_terminal() {
        return ScanOutcome::Skipped {
            reason: SkipReason::DayTerminal,
        };
    }

    let misses = day.presence.mark_missed(now);
    if misses < config.miss_ceiling {
        return ScanOutcome::Warned { misses };
    }

    if day.attendance.checked_out {
        return ScanOutcome::Skipped {
            reason: SkipReason::ManuallyCheckedOut,
        };
    }

    if day.attendance.check_in.is_some() {
        match day.attendance.record_check_out(now) {
            Ok(work_minutes) => {
                day.presence.auto_checked_out = true;
                day.attendance.append_remark("auto checkout: left early");
                ScanOutcome::AutoCheckedOut { work_minutes }
            }
            Err(err) => {
                // Guarded above; kept as a skip so one odd record cannot
                // wedge the whole cycle.
                tracing::error!(%err, "auto checkout failed");
                ScanOutcome::Skipped {
                    reason: SkipReason::ManuallyCheckedOut,
                }
            }
        }
    } else {
        day.presence.auto_marked_absent = true;
        day.attendance.status = AttendanceStatus::Absent;
        day.attendance.append_remark("auto absent: never seen on camera");
        ScanOutcome::MarkedAbsent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn emp(id: EmployeeId, name: &str) -> EmployeeInfo {
        EmployeeInfo {
            id,
            code: format!("EMP{id:03}"),
            name: name.to_string(),
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn cycle(
        store: &MemoryStore,
        roster: &[EmployeeInfo],
        seen: &[EmployeeId],
        now: NaiveDateTime,
    ) -> ScanSummary {
        let recognized: HashSet<EmployeeId> = seen.iter().copied().collect();
        run_scan_cycle(
            store,
            roster,
            &recognized,
            now,
            &ScheduleBook::default(),
            TrackerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_sighting_checks_in() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];

        let summary = cycle(&store, &roster, &[1], at(9, 5));
        assert_eq!(summary.checked_in, vec!["Ada"]);

        let day = store.day(1, at(9, 5).date()).unwrap().unwrap();
        assert_eq!(day.attendance.status, AttendanceStatus::Present);
        assert_eq!(day.attendance.method, Some(CheckInMethod::Ambient));
        assert_eq!(day.presence.not_present_count, 0);
    }

    #[test]
    fn test_late_sighting_checks_in_late() {
        let store = MemoryStore::default();
        let summary = cycle(&store, &[emp(1, "Ada")], &[1], at(10, 30));
        assert_eq!(summary.checked_in.len(), 1);
        let day = store.day(1, at(10, 30).date()).unwrap().unwrap();
        assert_eq!(day.attendance.status, AttendanceStatus::Late);
    }

    #[test]
    fn test_misses_warn_twice_then_absent_once() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];

        let s1 = cycle(&store, &roster, &[], at(10, 0));
        assert_eq!(s1.warned, vec!["Ada"]);
        let s2 = cycle(&store, &roster, &[], at(10, 5));
        assert_eq!(s2.warned, vec!["Ada"]);

        let s3 = cycle(&store, &roster, &[], at(10, 10));
        assert_eq!(s3.marked_absent, vec!["Ada"]);

        let day = store.day(1, at(10, 10).date()).unwrap().unwrap();
        assert!(day.presence.auto_marked_absent);
        assert!(!day.presence.auto_checked_out);
        assert_eq!(day.attendance.status, AttendanceStatus::Absent);
        assert_eq!(day.presence.not_present_count, 3);

        // Further misses are idempotent: no second action, frozen counter.
        let s4 = cycle(&store, &roster, &[], at(10, 15));
        assert!(s4.marked_absent.is_empty());
        assert!(s4.warned.is_empty());
        let day = store.day(1, at(10, 15).date()).unwrap().unwrap();
        assert_eq!(day.presence.not_present_count, 3);
        assert_eq!(day.presence.last_scan, Some(at(10, 10)));
    }

    #[test]
    fn test_sighting_resets_miss_counter() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];

        cycle(&store, &roster, &[1], at(9, 0));
        cycle(&store, &roster, &[], at(9, 10));
        cycle(&store, &roster, &[], at(9, 20));
        // Seen again on what would have been the fatal third miss.
        cycle(&store, &roster, &[1], at(9, 30));

        let day = store.day(1, at(9, 30).date()).unwrap().unwrap();
        assert_eq!(day.presence.not_present_count, 0);
        assert!(!day.presence.is_terminal());
        assert!(!day.attendance.checked_out);
    }

    #[test]
    fn test_open_check_in_becomes_auto_checkout() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];

        cycle(&store, &roster, &[1], at(9, 0));
        cycle(&store, &roster, &[], at(12, 0));
        cycle(&store, &roster, &[], at(12, 10));
        let s = cycle(&store, &roster, &[], at(12, 20));
        assert_eq!(s.auto_checked_out, vec!["Ada"]);

        let day = store.day(1, at(12, 20).date()).unwrap().unwrap();
        assert!(day.presence.auto_checked_out);
        assert!(!day.presence.auto_marked_absent);
        assert!(day.attendance.checked_out);
        assert_eq!(day.attendance.work_minutes, Some(200));
        assert_eq!(day.attendance.check_out, Some(at(12, 20)));

        // A later manual checkout attempt is blocked by the record itself.
        let mut err = None;
        store
            .with_day(1, at(12, 20).date(), &mut |d| {
                err = d.attendance.record_check_out(at(13, 0)).err();
            })
            .unwrap();
        assert_eq!(err, Some(crate::attendance::AttendanceError::AlreadyCheckedOut));
    }

    #[test]
    fn test_manual_checkout_day_is_skipped_not_actioned() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];
        let date = at(9, 0).date();

        cycle(&store, &roster, &[1], at(9, 0));
        store
            .with_day(1, date, &mut |day| {
                day.attendance.record_check_out(at(11, 0)).unwrap();
            })
            .unwrap();

        for minute in [0, 10, 20, 30] {
            cycle(&store, &roster, &[], at(12, minute));
        }

        let day = store.day(1, date).unwrap().unwrap();
        assert!(!day.presence.auto_checked_out);
        assert!(!day.presence.auto_marked_absent);
        assert_eq!(day.attendance.check_out, Some(at(11, 0)));
    }

    #[test]
    fn test_mixed_roster_single_cycle() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada"), emp(2, "Ben"), emp(3, "Cleo")];

        let summary = cycle(&store, &roster, &[1, 3], at(9, 0));
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.recognized, 2);
        assert_eq!(summary.present, vec!["Ada", "Cleo"]);
        assert_eq!(summary.checked_in.len(), 2);
        assert_eq!(summary.warned, vec!["Ben"]);
    }

    #[test]
    fn test_repeat_sighting_reported_present_without_second_check_in() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];

        let first = cycle(&store, &roster, &[1], at(9, 0));
        assert_eq!(first.checked_in, vec!["Ada"]);
        assert_eq!(first.present, vec!["Ada"]);

        let second = cycle(&store, &roster, &[1], at(9, 10));
        assert!(second.checked_in.is_empty());
        assert_eq!(second.present, vec!["Ada"]);
    }

    #[test]
    fn test_reappearance_after_absence_still_checks_in() {
        let store = MemoryStore::default();
        let roster = [emp(1, "Ada")];

        for minute in [0, 10, 20] {
            cycle(&store, &roster, &[], at(10, minute));
        }
        let day = store.day(1, at(10, 20).date()).unwrap().unwrap();
        assert!(day.presence.auto_marked_absent);

        // The terminal freeze covers misses only; a real sighting still
        // refreshes presence and records the first check-in of the day.
        let summary = cycle(&store, &roster, &[1], at(10, 30));
        assert_eq!(summary.checked_in, vec!["Ada"]);
        assert_eq!(summary.present, vec!["Ada"]);

        let day = store.day(1, at(10, 30).date()).unwrap().unwrap();
        assert_eq!(day.attendance.check_in, Some(at(10, 30)));
        assert_eq!(day.presence.not_present_count, 0);
    }
}
