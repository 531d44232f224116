//! D-Bus control surface for the attendance daemon.
//!
//! Bus name: org.rollcall.Attendance1
//! Object path: /org/rollcall/Attendance1
//!
//! Structured results cross the bus as JSON strings; binary image payloads
//! (confirmation snapshots, challenge frames) as byte arrays.

use crate::engine::{parse_challenge_kind, EngineError, EngineHandle};
use zbus::interface;

pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::UnknownChallenge(_) | EngineError::UndecodableImage(_) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        EngineError::LivenessUnavailable => zbus::fdo::Error::NotSupported(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Run one presence scan cycle and return the summary as JSON.
    async fn scan(&self) -> zbus::fdo::Result<String> {
        tracing::info!("scan requested");
        let summary = self.engine.scan().await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Confirm a claimed identity from a submitted snapshot and check the
    /// employee in on success. Returns the confirmation outcome as JSON.
    async fn confirm(&self, employee: i64, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(employee, bytes = image.len(), "confirm requested");
        let reply = self.engine.confirm(employee, image).await.map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Register a new employee and return the assigned ID.
    async fn add_employee(&self, code: &str, name: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(code, name, "employee registration requested");
        self.engine
            .add_employee(code.to_string(), name.to_string())
            .await
            .map_err(to_fdo)
    }

    /// Enroll a face template for an employee from a snapshot and rebuild
    /// the model. Returns the enrollment outcome as JSON.
    async fn enroll(
        &self,
        employee: i64,
        image: Vec<u8>,
        make_primary: bool,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(employee, bytes = image.len(), "enrollment requested");
        let reply = self
            .engine
            .enroll(employee, image, make_primary)
            .await
            .map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Deactivate an employee; true when a row changed. Their templates
    /// stop contributing to the model immediately.
    async fn deactivate(&self, employee: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(employee, "deactivation requested");
        self.engine.deactivate(employee).await.map_err(to_fdo)
    }

    /// Rebuild the recognition model from the template store.
    async fn rebuild(&self) -> zbus::fdo::Result<String> {
        tracing::info!("model rebuild requested");
        let report = self.engine.rebuild().await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Start a liveness challenge: "blink", "turn_left", "turn_right", "nod".
    async fn start_challenge(&self, kind: &str) -> zbus::fdo::Result<()> {
        tracing::info!(kind, "challenge requested");
        let kind = parse_challenge_kind(kind).map_err(to_fdo)?;
        self.engine.start_challenge(kind).await.map_err(to_fdo)
    }

    /// Feed one frame to the active liveness session.
    async fn challenge_frame(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let reply = self.engine.challenge_frame(image).await.map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Today's presence and attendance state for one employee, as JSON.
    /// Returns "null" when the employee has no record today.
    async fn presence(&self, employee: i64) -> zbus::fdo::Result<String> {
        let day = self.engine.snapshot(employee).await.map_err(to_fdo)?;
        to_json(&day)
    }

    /// Daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Delete today's presence records; returns how many were cleared.
    async fn reset_presence(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("presence reset requested");
        let cleared = self.engine.reset_presence().await.map_err(to_fdo)?;
        Ok(cleared as u32)
    }
}
