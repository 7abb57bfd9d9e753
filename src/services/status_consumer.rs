//! Sole writer of project status: applies authoritative transitions from the
//! status queue to the persisted record.
//!
//! Application is idempotent. Message timestamps become the record's
//! timestamps, so a duplicate delivery produces an identical record. Order is
//! decided by delivery attempt first; timestamps only order messages of one
//! attempt, which all come from the same worker clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::store::{ProjectStore, StoreError};
use crate::models::project::{ProjectRecord, ProjectStatus};
use crate::models::status::{AuthoritativeStatus, StatusUpdate};
use crate::services::status::StatusChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record changed and was persisted.
    Applied,
    /// Duplicate or disallowed transition; nothing to write.
    Unchanged,
    /// Older than the record's last transition.
    Stale,
    /// No project with that id.
    Missing,
}

/// Apply `update` to `record` in place.
pub fn apply_status_update(record: &mut ProjectRecord, update: &StatusUpdate) -> ApplyOutcome {
    let newer_attempt = update.attempt > record.status_attempt;
    // A produced mesh is kept whichever attempt reports it.
    let late_completion =
        update.status == AuthoritativeStatus::Completed && record.status != ProjectStatus::Finished;

    if !late_completion {
        if update.attempt < record.status_attempt {
            return ApplyOutcome::Stale;
        }
        if !newer_attempt
            && record
                .last_transition_at()
                .is_some_and(|last| update.timestamp < last)
        {
            return ApplyOutcome::Stale;
        }
    }

    let before = record.clone();
    match (update.status, record.status) {
        (_, ProjectStatus::Finished) if update.status != AuthoritativeStatus::Completed => {}
        (AuthoritativeStatus::Processing, ProjectStatus::Processing) => {
            if newer_attempt
                || record
                    .processing_started_at
                    .map_or(true, |started| started < update.timestamp)
            {
                record.processing_started_at = Some(update.timestamp);
            }
        }
        (AuthoritativeStatus::Processing, _) => {
            record.status = ProjectStatus::Processing;
            record.processing_started_at = Some(update.timestamp);
            record.completed_at = None;
            record.error_message = None;
        }
        (AuthoritativeStatus::Completed, _) => {
            record.status = ProjectStatus::Finished;
            record.completed_at = Some(update.timestamp);
            if let Some(path) = &update.output_model_path {
                record.output_model_path = Some(path.clone());
            }
            record.error_message = None;
        }
        (AuthoritativeStatus::Failed, _) => {
            record.status = ProjectStatus::Failed;
            record.completed_at = Some(update.timestamp);
            record.error_message = update.error_message.clone();
        }
    }

    if *record == before {
        return ApplyOutcome::Unchanged;
    }
    record.status_attempt = record.status_attempt.max(update.attempt);
    ApplyOutcome::Applied
}

const BLOCK_MS: u64 = 5_000;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct StatusConsumer {
    store: Arc<dyn ProjectStore>,
}

impl StatusConsumer {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    /// Apply one message. An error means it must be retried later.
    pub async fn handle(&self, update: &StatusUpdate) -> Result<ApplyOutcome, StoreError> {
        let Some(mut record) = self.store.find_project(update.project_id).await? else {
            warn!(project_id = update.project_id, status = %update.status, "Status update for unknown project dropped");
            return Ok(ApplyOutcome::Missing);
        };

        let outcome = apply_status_update(&mut record, update);
        match outcome {
            ApplyOutcome::Applied => {
                self.store.update_project(&record).await?;
                metrics::counter!("status_updates_applied_total", "status" => update.status.as_ref().to_string())
                    .increment(1);
                info!(
                    project_id = update.project_id,
                    status = %record.status,
                    "Project status updated"
                );
            }
            ApplyOutcome::Unchanged | ApplyOutcome::Stale => {
                metrics::counter!("status_updates_ignored_total").increment(1);
                debug!(project_id = update.project_id, outcome = ?outcome, "Status update ignored");
            }
            ApplyOutcome::Missing => {}
        }
        Ok(outcome)
    }

    /// Consume the status queue until `shutdown` flips to true.
    ///
    /// A message that fails to apply stays pending and is retried, ahead of
    /// newer messages, after a back-off.
    pub async fn run(&self, channel: StatusChannel, consumer: String, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        info!(consumer = %consumer, "Status consumer started");

        while !*shutdown.borrow() {
            let delivery = match channel.read_next(&consumer, BLOCK_MS).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to read status queue");
                    backoff = wait(backoff, &mut shutdown).await;
                    continue;
                }
            };

            let update = match delivery.update() {
                Ok(update) => update,
                Err(e) => {
                    error!(message_id = %delivery.message_id, error = %e, "Dropping undecodable status message");
                    if let Err(e) = channel.ack(&delivery).await {
                        warn!(message_id = %delivery.message_id, error = %e, "Failed to acknowledge status message");
                    }
                    continue;
                }
            };

            match self.handle(&update).await {
                Ok(_) => {
                    backoff = INITIAL_BACKOFF;
                    if let Err(e) = channel.ack(&delivery).await {
                        warn!(message_id = %delivery.message_id, error = %e, "Failed to acknowledge status message");
                    }
                }
                Err(e) => {
                    warn!(
                        project_id = update.project_id,
                        message_id = %delivery.message_id,
                        error = %e,
                        "Failed to apply status update, will retry"
                    );
                    backoff = wait(backoff, &mut shutdown).await;
                }
            }
        }

        info!(consumer = %consumer, "Status consumer stopped");
    }
}

/// Sleep for `backoff` (or until shutdown) and return the next back-off.
async fn wait(backoff: Duration, shutdown: &mut watch::Receiver<bool>) -> Duration {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        _ = shutdown.changed() => {}
    }
    (backoff * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 4, 12, minute, 0).unwrap()
    }

    fn record(status: ProjectStatus) -> ProjectRecord {
        ProjectRecord {
            id: 1,
            name: "fountain".to_string(),
            status,
            zip_file_path: "uploads/abc.zip".to_string(),
            output_model_path: None,
            created_at: t(0),
            processing_started_at: None,
            completed_at: None,
            error_message: None,
            status_attempt: 0,
        }
    }

    #[test]
    fn test_processing_from_in_queue() {
        let mut rec = record(ProjectStatus::InQueue);
        let outcome = apply_status_update(&mut rec, &StatusUpdate::processing(1, t(1)));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(rec.status, ProjectStatus::Processing);
        assert_eq!(rec.processing_started_at, Some(t(1)));
    }

    #[test]
    fn test_duplicate_delivery_is_unchanged() {
        let mut rec = record(ProjectStatus::InQueue);
        let update = StatusUpdate::completed(1, "project_1/output/dense/meshed-poisson.ply".to_string(), t(5));
        assert_eq!(apply_status_update(&mut rec, &update), ApplyOutcome::Applied);
        let once = rec.clone();
        assert_eq!(apply_status_update(&mut rec, &update), ApplyOutcome::Unchanged);
        assert_eq!(rec, once);
    }

    #[test]
    fn test_processing_never_reopens_finished() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::completed(1, "m.ply".to_string(), t(5)));
        let outcome = apply_status_update(&mut rec, &StatusUpdate::processing(1, t(6)));
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(rec.status, ProjectStatus::Finished);
    }

    #[test]
    fn test_late_processing_is_stale() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::failed(1, "Mapper failed".to_string(), t(5)));
        let outcome = apply_status_update(&mut rec, &StatusUpdate::processing(1, t(4)));
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(rec.status, ProjectStatus::Failed);
    }

    #[test]
    fn test_failed_then_retry_then_finished() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::processing(1, t(1)));
        apply_status_update(&mut rec, &StatusUpdate::failed(1, "Connection refused".to_string(), t(2)));
        assert_eq!(rec.status, ProjectStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some("Connection refused"));

        apply_status_update(&mut rec, &StatusUpdate::processing(1, t(3)));
        assert_eq!(rec.status, ProjectStatus::Processing);
        assert_eq!(rec.processing_started_at, Some(t(3)));
        assert!(rec.completed_at.is_none());
        assert!(rec.error_message.is_none());

        apply_status_update(&mut rec, &StatusUpdate::completed(1, "project_1/mesh.ply".to_string(), t(9)));
        assert_eq!(rec.status, ProjectStatus::Finished);
        assert_eq!(rec.completed_at, Some(t(9)));
        assert_eq!(rec.output_model_path.as_deref(), Some("project_1/mesh.ply"));
    }

    #[test]
    fn test_newer_processing_restarts_attempt() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::processing(1, t(1)));
        let later = t(1) + ChronoDuration::seconds(30);
        assert_eq!(
            apply_status_update(&mut rec, &StatusUpdate::processing(1, later)),
            ApplyOutcome::Applied
        );
        assert_eq!(rec.processing_started_at, Some(later));
        assert_eq!(
            apply_status_update(&mut rec, &StatusUpdate::processing(1, later)),
            ApplyOutcome::Unchanged
        );
    }

    #[test]
    fn test_failed_never_overrides_finished() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::completed(1, "m.ply".to_string(), t(5)));
        let outcome = apply_status_update(&mut rec, &StatusUpdate::failed(1, "late".to_string(), t(6)));
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert!(rec.error_message.is_none());
    }

    #[test]
    fn test_retry_on_host_with_slower_clock_is_applied() {
        let mut rec = record(ProjectStatus::InQueue);
        let t0 = t(10);
        apply_status_update(&mut rec, &StatusUpdate::processing(1, t0).with_attempt(1));
        apply_status_update(
            &mut rec,
            &StatusUpdate::failed(1, "Connection reset".to_string(), t0 + ChronoDuration::seconds(10)).with_attempt(1),
        );

        // Second worker's clock runs 30 seconds behind the first.
        let skewed = t0 - ChronoDuration::seconds(30);
        let processing = StatusUpdate::processing(1, skewed + ChronoDuration::seconds(12)).with_attempt(2);
        assert_eq!(apply_status_update(&mut rec, &processing), ApplyOutcome::Applied);
        assert_eq!(rec.status, ProjectStatus::Processing);
        assert!(rec.error_message.is_none());

        let completed =
            StatusUpdate::completed(1, "project_1/mesh.ply".to_string(), skewed + ChronoDuration::seconds(27)).with_attempt(2);
        assert_eq!(apply_status_update(&mut rec, &completed), ApplyOutcome::Applied);
        assert_eq!(rec.status, ProjectStatus::Finished);
        assert_eq!(rec.status_attempt, 2);
    }

    #[test]
    fn test_failure_from_superseded_attempt_is_stale() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::processing(1, t(1)).with_attempt(2));
        let late = StatusUpdate::failed(1, "Mapper failed".to_string(), t(5)).with_attempt(1);
        assert_eq!(apply_status_update(&mut rec, &late), ApplyOutcome::Stale);
        assert_eq!(rec.status, ProjectStatus::Processing);
    }

    #[test]
    fn test_completion_from_earlier_attempt_is_kept() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::processing(1, t(3)).with_attempt(2));
        let completed = StatusUpdate::completed(1, "project_1/mesh.ply".to_string(), t(2)).with_attempt(1);
        assert_eq!(apply_status_update(&mut rec, &completed), ApplyOutcome::Applied);
        assert_eq!(rec.status, ProjectStatus::Finished);
        assert_eq!(rec.status_attempt, 2);
    }

    #[test]
    fn test_completed_refreshes_output_path() {
        let mut rec = record(ProjectStatus::InQueue);
        apply_status_update(&mut rec, &StatusUpdate::completed(1, "old.ply".to_string(), t(5)));
        let outcome = apply_status_update(&mut rec, &StatusUpdate::completed(1, "new.obj".to_string(), t(5)));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(rec.output_model_path.as_deref(), Some("new.obj"));
    }
}
