//! Wire messages carried by the work queue and the two status channels.
//!
//! Field names are PascalCase on the wire (`ProjectId`, `OutputModelPath`, ...)
//! so producers and consumers written against the JSON contract interoperate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Project id reserved for worker idle heartbeats on the verbose channel.
pub const HEARTBEAT_PROJECT_ID: i64 = 0;

/// Work-queue payload: one per uploaded project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobMessage {
    pub project_id: i64,
}

/// Status values allowed on the authoritative channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum AuthoritativeStatus {
    Processing,
    Completed,
    Failed,
}

/// Attempt assumed for status messages that carry none.
pub const FIRST_ATTEMPT: u32 = 1;

fn first_attempt() -> u32 {
    FIRST_ATTEMPT
}

/// Authoritative status transition, applied to the persisted project record.
///
/// `attempt` is the work-queue delivery attempt that produced the message.
/// Messages from a later attempt supersede earlier ones whatever their
/// timestamps, since attempts may run on hosts with different clocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusUpdate {
    pub project_id: i64,
    pub status: AuthoritativeStatus,
    pub error_message: Option<String>,
    pub output_model_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

impl StatusUpdate {
    pub fn processing(project_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            project_id,
            status: AuthoritativeStatus::Processing,
            error_message: None,
            output_model_path: None,
            timestamp,
            attempt: FIRST_ATTEMPT,
        }
    }

    pub fn completed(project_id: i64, output_model_path: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            project_id,
            status: AuthoritativeStatus::Completed,
            error_message: None,
            output_model_path: Some(output_model_path),
            timestamp,
            attempt: FIRST_ATTEMPT,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn failed(project_id: i64, error_message: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            project_id,
            status: AuthoritativeStatus::Failed,
            error_message: Some(error_message),
            output_model_path: None,
            timestamp,
            attempt: FIRST_ATTEMPT,
        }
    }
}

/// Status values seen on the verbose channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum VerboseState {
    InQueue,
    Processing,
    Completed,
    Failed,
    Idle,
    #[serde(other)]
    Unknown,
}

impl VerboseState {
    /// Terminal states return a worker to idle.
    pub fn releases_worker(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Idle)
    }
}

/// Best-effort progress event for the live dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VerboseStatus {
    pub project_id: i64,
    pub status: VerboseState,
    #[serde(default)]
    pub worker_id: String,
    pub current_step: Option<String>,
    pub message: Option<String>,
    pub image_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl VerboseStatus {
    pub fn new(project_id: i64, status: VerboseState, worker_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            project_id,
            status,
            worker_id: worker_id.to_string(),
            current_step: None,
            message: None,
            image_count: None,
            timestamp,
        }
    }

    /// Idle heartbeat published while a worker waits for deliveries.
    pub fn heartbeat(worker_id: &str, timestamp: DateTime<Utc>) -> Self {
        let mut event = Self::new(HEARTBEAT_PROJECT_ID, VerboseState::Idle, worker_id, timestamp);
        event.current_step = Some("Waiting for projects".to_string());
        event
    }

    /// Published by the API once a project is enqueued. Carries no worker.
    pub fn queued(project_id: i64, timestamp: DateTime<Utc>) -> Self {
        let mut event = Self::new(project_id, VerboseState::InQueue, "", timestamp);
        event.message = Some("Queued for processing".to_string());
        event
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_image_count(mut self, image_count: Option<u32>) -> Self {
        self.image_count = image_count;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.project_id == HEARTBEAT_PROJECT_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 4, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_job_message_wire_shape() {
        let payload = serde_json::to_value(JobMessage { project_id: 42 }).unwrap();
        assert_eq!(payload, json!({ "ProjectId": 42 }));
    }

    #[test]
    fn test_status_update_wire_shape() {
        let update = StatusUpdate::completed(7, "project_7/output/dense/meshed-poisson.ply".to_string(), ts());
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["ProjectId"], 7);
        assert_eq!(value["Status"], "Completed");
        assert_eq!(value["ErrorMessage"], serde_json::Value::Null);
        assert_eq!(value["OutputModelPath"], "project_7/output/dense/meshed-poisson.ply");
        assert!(value["Timestamp"].as_str().unwrap().starts_with("2025-05-04T12:30:00"));
    }

    #[test]
    fn test_status_update_without_attempt_is_first_attempt() {
        let raw = r#"{"ProjectId":7,"Status":"Processing","ErrorMessage":null,"OutputModelPath":null,"Timestamp":"2025-05-04T12:30:00Z"}"#;
        let update: StatusUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.attempt, FIRST_ATTEMPT);

        let retried = StatusUpdate::processing(7, ts()).with_attempt(3);
        assert_eq!(serde_json::to_value(&retried).unwrap()["Attempt"], 3);
    }

    #[test]
    fn test_verbose_status_accepts_unknown_state_and_missing_worker() {
        let raw = r#"{"ProjectId":3,"Status":"Paused","CurrentStep":null,"Message":null,"ImageCount":null,"Timestamp":"2025-05-04T12:30:00Z"}"#;
        let event: VerboseStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(event.status, VerboseState::Unknown);
        assert!(event.worker_id.is_empty());
    }

    #[test]
    fn test_heartbeat_uses_reserved_project_id() {
        let event = VerboseStatus::heartbeat("worker-a", ts());
        assert!(event.is_heartbeat());
        assert_eq!(event.status, VerboseState::Idle);
    }
}
