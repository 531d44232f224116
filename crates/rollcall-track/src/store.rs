//! Attendance persistence seam.

use crate::attendance::AttendanceRecord;
use crate::presence::PresenceRecord;
use chrono::NaiveDate;
use rollcall_core::EmployeeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Everything tracked for one (employee, day) pair, mutated as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayState {
    pub presence: PresenceRecord,
    pub attendance: AttendanceRecord,
}

/// Per-day attendance storage.
///
/// `with_day` is the only write path: it runs the closure against the
/// (created-if-missing) record under whatever serialization the backend
/// provides, so concurrent get-or-create races collapse to one record and
/// a read-modify-write never interleaves with another writer.
pub trait AttendanceStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn with_day(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
        apply: &mut dyn FnMut(&mut DayState),
    ) -> Result<(), Self::Error>;

    /// Read-only snapshot; `None` when the pair was never touched.
    fn day(&self, employee: EmployeeId, date: NaiveDate) -> Result<Option<DayState>, Self::Error>;

    /// Delete every presence record for the given day, returning how many
    /// were cleared. Attendance records survive.
    fn reset_presence(&self, date: NaiveDate) -> Result<usize, Self::Error>;
}

#[derive(Error, Debug)]
pub enum MemoryStoreError {
    #[error("store mutex poisoned")]
    Poisoned,
}

/// Process-local store backing tests and single-host deployments.
#[derive(Default)]
pub struct MemoryStore {
    days: Mutex<HashMap<(EmployeeId, NaiveDate), DayState>>,
}

impl AttendanceStore for MemoryStore {
    type Error = MemoryStoreError;

    fn with_day(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
        apply: &mut dyn FnMut(&mut DayState),
    ) -> Result<(), Self::Error> {
        let mut days = self.days.lock().map_err(|_| MemoryStoreError::Poisoned)?;
        let state = days.entry((employee, date)).or_default();
        apply(state);
        Ok(())
    }

    fn day(&self, employee: EmployeeId, date: NaiveDate) -> Result<Option<DayState>, Self::Error> {
        let days = self.days.lock().map_err(|_| MemoryStoreError::Poisoned)?;
        Ok(days.get(&(employee, date)).cloned())
    }

    fn reset_presence(&self, date: NaiveDate) -> Result<usize, Self::Error> {
        let mut days = self.days.lock().map_err(|_| MemoryStoreError::Poisoned)?;
        let mut cleared = 0;
        for ((_, day), state) in days.iter_mut() {
            if *day == date {
                state.presence = PresenceRecord::default();
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[test]
    fn test_with_day_creates_once() {
        let store = MemoryStore::default();
        store
            .with_day(1, date(), &mut |day| {
                day.presence.scan_count += 1;
            })
            .unwrap();
        store
            .with_day(1, date(), &mut |day| {
                day.presence.scan_count += 1;
            })
            .unwrap();

        let day = store.day(1, date()).unwrap().unwrap();
        assert_eq!(day.presence.scan_count, 2);
    }

    #[test]
    fn test_untouched_day_reads_none() {
        let store = MemoryStore::default();
        assert!(store.day(42, date()).unwrap().is_none());
    }

    #[test]
    fn test_reset_presence_keeps_attendance() {
        let store = MemoryStore::default();
        let when = date().and_hms_opt(9, 0, 0).unwrap();
        store
            .with_day(1, date(), &mut |day| {
                day.presence.mark_seen(when);
                day.attendance.check_in = Some(when);
            })
            .unwrap();

        let cleared = store.reset_presence(date()).unwrap();
        assert_eq!(cleared, 1);

        let day = store.day(1, date()).unwrap().unwrap();
        assert_eq!(day.presence.status, PresenceStatus::Unknown);
        assert_eq!(day.presence.scan_count, 0);
        assert_eq!(day.attendance.check_in, Some(when));
    }
}
