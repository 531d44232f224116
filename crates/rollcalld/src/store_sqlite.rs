//! SQLite persistence: roster, templates, and per-day attendance state.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rollcall_core::{EmployeeId, EmployeeInfo, FaceTemplate, TemplateStore};
use rollcall_track::{AttendanceStore, DayState, PresenceRecord, ScheduleBook, WorkSchedule};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt day state for employee {employee} on {date}: {source}")]
    CorruptDayState {
        employee: EmployeeId,
        date: NaiveDate,
        source: serde_json::Error,
    },
    #[error("store mutex poisoned")]
    Poisoned,
}

/// Connection wrapper serializing all access through one mutex.
///
/// Day-state writes additionally run inside a transaction, so the
/// read-modify-write contract of [`AttendanceStore::with_day`] holds even
/// against other processes sharing the database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS employees (
    id              INTEGER PRIMARY KEY,
    code            TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    active          INTEGER NOT NULL DEFAULT 1,
    check_in_time   TEXT,
    check_out_time  TEXT,
    grace_minutes   INTEGER
);
CREATE TABLE IF NOT EXISTS templates (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id INTEGER NOT NULL REFERENCES employees(id) ON DELETE CASCADE,
    data        BLOB NOT NULL,
    is_primary  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_templates_employee ON templates(employee_id);
CREATE TABLE IF NOT EXISTS attendance_days (
    employee_id INTEGER NOT NULL,
    date        TEXT NOT NULL,
    state       TEXT NOT NULL,
    PRIMARY KEY (employee_id, date)
);
";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_employee(
        &self,
        code: &str,
        name: &str,
        schedule: Option<&WorkSchedule>,
    ) -> Result<EmployeeId, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO employees (code, name, check_in_time, check_out_time, grace_minutes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                code,
                name,
                schedule.map(|s| s.check_in.format("%H:%M").to_string()),
                schedule.map(|s| s.check_out.format("%H:%M").to_string()),
                schedule.map(|s| s.grace_minutes),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn deactivate_employee(&self, employee: EmployeeId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let changed = conn.execute(
            "UPDATE employees SET active = 0 WHERE id = ?1",
            params![employee],
        )?;
        Ok(changed > 0)
    }

    /// Store a template. The first template for an employee becomes primary;
    /// `make_primary` demotes any previous primary in the same transaction.
    pub fn insert_template(
        &self,
        employee: EmployeeId,
        data: &[u8],
        make_primary: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM templates WHERE employee_id = ?1",
            params![employee],
            |row| row.get(0),
        )?;
        let primary = make_primary || existing == 0;
        if primary {
            tx.execute(
                "UPDATE templates SET is_primary = 0 WHERE employee_id = ?1",
                params![employee],
            )?;
        }
        tx.execute(
            "INSERT INTO templates (employee_id, data, is_primary, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![employee, data, primary, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Global default plus the per-employee overrides stored on the roster.
    pub fn schedule_book(&self, default: WorkSchedule) -> Result<ScheduleBook, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut book = ScheduleBook::new(default);
        let mut stmt = conn.prepare(
            "SELECT id, check_in_time, check_out_time, grace_minutes
             FROM employees
             WHERE active = 1 AND check_in_time IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: EmployeeId = row.get(0)?;
            let check_in: String = row.get(1)?;
            let check_out: Option<String> = row.get(2)?;
            let grace: Option<i64> = row.get(3)?;
            Ok((id, check_in, check_out, grace))
        })?;
        for row in rows {
            let (id, check_in, check_out, grace) = row?;
            let Some(check_in) = parse_time(&check_in) else {
                tracing::warn!(employee = id, "unparseable schedule override ignored");
                continue;
            };
            book.set_override(
                id,
                WorkSchedule {
                    check_in,
                    check_out: check_out
                        .as_deref()
                        .and_then(parse_time)
                        .unwrap_or(default.check_out),
                    grace_minutes: grace.unwrap_or(default.grace_minutes),
                },
            );
        }
        Ok(book)
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

impl TemplateStore for SqliteStore {
    type Error = StoreError;

    fn templates(&self) -> Result<Vec<(EmployeeInfo, FaceTemplate)>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.code, e.name, t.data, t.is_primary, t.created_at
             FROM templates t
             JOIN employees e ON e.id = t.employee_id
             WHERE e.active = 1
             ORDER BY e.id, t.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let created: String = row.get(5)?;
            Ok((
                EmployeeInfo {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                },
                FaceTemplate {
                    data: row.get(3)?,
                    is_primary: row.get(4)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                },
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    fn roster(&self) -> Result<Vec<EmployeeInfo>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT e.id, e.code, e.name
             FROM employees e
             JOIN templates t ON t.employee_id = e.id
             WHERE e.active = 1
             ORDER BY e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EmployeeInfo {
                id: row.get(0)?,
                code: row.get(1)?,
                name: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

impl AttendanceStore for SqliteStore {
    type Error = StoreError;

    fn with_day(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
        apply: &mut dyn FnMut(&mut DayState),
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT state FROM attendance_days WHERE employee_id = ?1 AND date = ?2",
                params![employee, date.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let mut state = match existing {
            Some(json) => serde_json::from_str(&json).map_err(|source| {
                StoreError::CorruptDayState {
                    employee,
                    date,
                    source,
                }
            })?,
            None => DayState::default(),
        };

        apply(&mut state);

        let json = serde_json::to_string(&state).map_err(|source| StoreError::CorruptDayState {
            employee,
            date,
            source,
        })?;
        tx.execute(
            "INSERT INTO attendance_days (employee_id, date, state) VALUES (?1, ?2, ?3)
             ON CONFLICT (employee_id, date) DO UPDATE SET state = excluded.state",
            params![employee, date.to_string(), json],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn day(&self, employee: EmployeeId, date: NaiveDate) -> Result<Option<DayState>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state FROM attendance_days WHERE employee_id = ?1 AND date = ?2",
                params![employee, date.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| {
            serde_json::from_str(&json).map_err(|source| StoreError::CorruptDayState {
                employee,
                date,
                source,
            })
        })
        .transpose()
    }

    fn reset_presence(&self, date: NaiveDate) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        let mut cleared = 0usize;
        {
            let mut stmt = tx.prepare(
                "SELECT employee_id, state FROM attendance_days WHERE date = ?1",
            )?;
            let rows = stmt.query_map(params![date.to_string()], |row| {
                let employee: EmployeeId = row.get(0)?;
                let state: String = row.get(1)?;
                Ok((employee, state))
            })?;
            let rows = rows.collect::<Result<Vec<_>, _>>()?;
            for (employee, json) in rows {
                let mut state: DayState = serde_json::from_str(&json).map_err(|source| {
                    StoreError::CorruptDayState {
                        employee,
                        date,
                        source,
                    }
                })?;
                state.presence = PresenceRecord::default();
                let json = serde_json::to_string(&state).map_err(|source| {
                    StoreError::CorruptDayState {
                        employee,
                        date,
                        source,
                    }
                })?;
                tx.execute(
                    "UPDATE attendance_days SET state = ?1 WHERE employee_id = ?2 AND date = ?3",
                    params![json, employee, date.to_string()],
                )?;
                cleared += 1;
            }
        }
        tx.commit()?;
        tracing::info!(%date, cleared, "presence records reset");
        Ok(cleared)
    }
}
