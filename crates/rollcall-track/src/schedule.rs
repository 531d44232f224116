//! Work schedules and the late rule.

use crate::attendance::AttendanceStatus;
use chrono::{Duration, NaiveTime};
use rollcall_core::EmployeeId;
use std::collections::HashMap;

/// Daily working hours plus the check-in grace period.
#[derive(Debug, Clone, Copy)]
pub struct WorkSchedule {
    pub check_in: NaiveTime,
    pub check_out: NaiveTime,
    pub grace_minutes: i64,
}

impl Default for WorkSchedule {
    fn default() -> Self {
        Self {
            check_in: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            check_out: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
            grace_minutes: 15,
        }
    }
}

impl WorkSchedule {
    /// Latest clock time that still counts as on time. The boundary itself
    /// is inclusive: arriving at exactly check-in + grace is Present.
    pub fn late_cutoff(&self) -> NaiveTime {
        self.check_in + Duration::minutes(self.grace_minutes)
    }

    pub fn status_for_check_in(&self, at: NaiveTime) -> AttendanceStatus {
        if at <= self.late_cutoff() {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        }
    }
}

/// Global schedule plus per-employee overrides.
#[derive(Debug, Clone, Default)]
pub struct ScheduleBook {
    default: WorkSchedule,
    overrides: HashMap<EmployeeId, WorkSchedule>,
}

impl ScheduleBook {
    pub fn new(default: WorkSchedule) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Replace any previous override for this employee.
    pub fn set_override(&mut self, employee: EmployeeId, schedule: WorkSchedule) {
        self.overrides.insert(employee, schedule);
    }

    pub fn clear_override(&mut self, employee: EmployeeId) {
        self.overrides.remove(&employee);
    }

    pub fn for_employee(&self, employee: EmployeeId) -> &WorkSchedule {
        self.overrides.get(&employee).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_on_time_before_cutoff() {
        let s = WorkSchedule::default();
        assert_eq!(s.status_for_check_in(t(8, 45)), AttendanceStatus::Present);
        assert_eq!(s.status_for_check_in(t(9, 0)), AttendanceStatus::Present);
    }

    #[test]
    fn test_grace_boundary_is_inclusive() {
        let s = WorkSchedule::default();
        assert_eq!(s.status_for_check_in(t(9, 15)), AttendanceStatus::Present);
    }

    #[test]
    fn test_one_minute_past_grace_is_late() {
        let s = WorkSchedule::default();
        assert_eq!(s.status_for_check_in(t(9, 16)), AttendanceStatus::Late);
    }

    #[test]
    fn test_override_replaces_global_schedule() {
        let mut book = ScheduleBook::default();
        book.set_override(
            7,
            WorkSchedule {
                check_in: t(11, 0),
                check_out: t(20, 0),
                grace_minutes: 15,
            },
        );

        // 10:00 is late for the default schedule, fine for the override.
        assert_eq!(
            book.for_employee(7).status_for_check_in(t(10, 0)),
            AttendanceStatus::Present
        );
        assert_eq!(
            book.for_employee(8).status_for_check_in(t(10, 0)),
            AttendanceStatus::Late
        );

        book.clear_override(7);
        assert_eq!(
            book.for_employee(7).status_for_check_in(t(10, 0)),
            AttendanceStatus::Late
        );
    }
}
