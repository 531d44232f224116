//! Per-day attendance record and its state transitions.

use crate::schedule::WorkSchedule;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AttendanceError {
    #[error("already checked in today")]
    AlreadyCheckedIn,
    #[error("cannot check out without a check-in")]
    NotCheckedIn,
    #[error("already checked out today")]
    AlreadyCheckedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Absent,
    Present,
    Late,
    HalfDay,
    OnLeave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInMethod {
    /// Recognized by the ambient camera loop.
    Ambient,
    /// Employee-initiated confirmation flow.
    SelfService,
    /// Entered by an administrator.
    Manual,
}

/// One employee's attendance for one calendar day.
///
/// Invariants: a check-out implies a check-in and `checked_out`; `Late`
/// is only ever assigned by the schedule's late rule at check-in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub status: AttendanceStatus,
    pub checked_out: bool,
    /// Worked time in whole minutes, set at check-out.
    pub work_minutes: Option<i64>,
    pub method: Option<CheckInMethod>,
    pub remarks: Option<String>,
}

impl Default for AttendanceRecord {
    fn default() -> Self {
        Self {
            check_in: None,
            check_out: None,
            status: AttendanceStatus::Absent,
            checked_out: false,
            work_minutes: None,
            method: None,
            remarks: None,
        }
    }
}

impl AttendanceRecord {
    /// First check-in of the day. Applies the schedule's late rule.
    pub fn record_check_in(
        &mut self,
        at: NaiveDateTime,
        schedule: &WorkSchedule,
        method: CheckInMethod,
    ) -> Result<AttendanceStatus, AttendanceError> {
        if self.check_in.is_some() {
            return Err(AttendanceError::AlreadyCheckedIn);
        }
        let status = schedule.status_for_check_in(at.time());
        self.check_in = Some(at);
        self.status = status;
        self.method = Some(method);
        Ok(status)
    }

    /// Check out, computing worked minutes. Fails without an open check-in.
    pub fn record_check_out(&mut self, at: NaiveDateTime) -> Result<i64, AttendanceError> {
        let check_in = self.check_in.ok_or(AttendanceError::NotCheckedIn)?;
        if self.checked_out {
            return Err(AttendanceError::AlreadyCheckedOut);
        }
        let minutes = (at - check_in).num_minutes();
        self.check_out = Some(at);
        self.checked_out = true;
        self.work_minutes = Some(minutes);
        Ok(minutes)
    }

    pub fn append_remark(&mut self, note: &str) {
        match &mut self.remarks {
            Some(remarks) => {
                remarks.push_str("; ");
                remarks.push_str(note);
            }
            None => self.remarks = Some(note.to_string()),
        }
    }
}
