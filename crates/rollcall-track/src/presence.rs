//! Per-day presence counters for the ambient scan loop.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Present,
    NotPresent,
    Unknown,
}

/// Rolling presence state for one employee on one day.
///
/// `auto_marked_absent` and `auto_checked_out` are mutually exclusive and
/// monotonic for the day; once either is set the record is terminal and the
/// miss counter freezes. Only deleting the record clears them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub scan_count: u32,
    pub not_present_count: u32,
    pub last_seen: Option<NaiveDateTime>,
    pub last_scan: Option<NaiveDateTime>,
    pub status: PresenceStatus,
    pub auto_marked_absent: bool,
    pub auto_checked_out: bool,
}

impl Default for PresenceRecord {
    fn default() -> Self {
        Self {
            scan_count: 0,
            not_present_count: 0,
            last_seen: None,
            last_scan: None,
            status: PresenceStatus::Unknown,
            auto_marked_absent: false,
            auto_checked_out: false,
        }
    }
}

impl PresenceRecord {
    pub fn is_terminal(&self) -> bool {
        self.auto_marked_absent || self.auto_checked_out
    }

    /// Seen in a scan: miss counter resets, presence stamps refresh.
    pub fn mark_seen(&mut self, at: NaiveDateTime) {
        self.scan_count += 1;
        self.not_present_count = 0;
        self.last_seen = Some(at);
        self.last_scan = Some(at);
        self.status = PresenceStatus::Present;
    }

    /// Missed in a scan: returns the new consecutive-miss count.
    pub fn mark_missed(&mut self, at: NaiveDateTime) -> u32 {
        self.scan_count += 1;
        self.not_present_count += 1;
        self.last_scan = Some(at);
        self.status = PresenceStatus::NotPresent;
        self.not_present_count
    }
}
