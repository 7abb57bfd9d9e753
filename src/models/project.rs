use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Persisted processing status of a reconstruction project.
///
/// Moves forward along `InQueue -> Processing -> {Finished | Failed}`; a retried
/// job may re-enter `Processing` from `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
pub enum ProjectStatus {
    InQueue,
    Processing,
    Finished,
    Failed,
}

/// A reconstruction project as stored in PostgreSQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub status: ProjectStatus,
    pub zip_file_path: String,
    pub output_model_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Delivery attempt of the last applied transition, 0 before any.
    pub status_attempt: u32,
}

impl ProjectRecord {
    /// Time of the most recent status transition applied to this record.
    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        match (self.processing_started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(started.max(completed)),
            (started, completed) => started.or(completed),
        }
    }
}

/// Text fields of a project creation request.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateProjectRequest {
    #[garde(length(chars, min = 1, max = 255))]
    pub name: String,
}

/// Project as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectResponse {
    pub id: i64,
    pub name: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub download_url: Option<String>,
}

impl ProjectResponse {
    /// The download link is only offered once a finished model exists.
    pub fn from_record(record: ProjectRecord, base_url: &str) -> Self {
        let download_url = match (&record.status, &record.output_model_path) {
            (ProjectStatus::Finished, Some(_)) => Some(format!(
                "{}/api/v1/projects/{}/download",
                base_url.trim_end_matches('/'),
                record.id
            )),
            _ => None,
        };
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            created_at: record.created_at,
            processing_started_at: record.processing_started_at,
            completed_at: record.completed_at,
            error_message: record.error_message,
            download_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [
            ProjectStatus::InQueue,
            ProjectStatus::Processing,
            ProjectStatus::Finished,
            ProjectStatus::Failed,
        ] {
            assert_eq!(ProjectStatus::from_str(status.as_ref()).unwrap(), status);
        }
        assert!(ProjectStatus::from_str("Completed").is_err());
    }

    #[test]
    fn test_last_transition_prefers_latest_timestamp() {
        let started = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let completed = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let record = ProjectRecord {
            id: 1,
            name: "statue".to_string(),
            status: ProjectStatus::Processing,
            zip_file_path: "uploads/a.zip".to_string(),
            output_model_path: None,
            created_at: completed,
            processing_started_at: Some(started),
            completed_at: Some(completed),
            error_message: None,
            status_attempt: 1,
        };
        assert_eq!(record.last_transition_at(), Some(started));
    }

    #[test]
    fn test_download_url_only_when_finished_with_model() {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut record = ProjectRecord {
            id: 7,
            name: "bridge".to_string(),
            status: ProjectStatus::Processing,
            zip_file_path: "uploads/b.zip".to_string(),
            output_model_path: Some("project_7/output/dense/meshed-poisson.ply".to_string()),
            created_at: created,
            processing_started_at: Some(created),
            completed_at: None,
            error_message: None,
            status_attempt: 1,
        };
        assert!(ProjectResponse::from_record(record.clone(), "http://api").download_url.is_none());

        record.status = ProjectStatus::Finished;
        let response = ProjectResponse::from_record(record, "http://api/");
        assert_eq!(
            response.download_url.as_deref(),
            Some("http://api/api/v1/projects/7/download")
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["Status"], "Finished");
        assert_eq!(json["Id"], 7);
    }

    #[test]
    fn test_create_request_rejects_blank_and_long_names() {
        assert!(CreateProjectRequest { name: String::new() }.validate().is_err());
        assert!(CreateProjectRequest { name: "n".repeat(256) }.validate().is_err());
        assert!(CreateProjectRequest { name: "Old mill".to_string() }.validate().is_ok());
    }
}
