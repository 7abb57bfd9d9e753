//! Worker execution engine: one in-flight job per worker.
//!
//! `JobProcessor` runs a single job against the ports and decides how the
//! delivery is settled. `WorkerEngine` owns the broker loop around it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::models::status::{StatusUpdate, VerboseState, VerboseStatus};
use crate::services::failure::JobError;
use crate::services::pipeline::{PipelinePaths, PipelineStage, StageRunner};
use crate::services::progress::ProgressReporter;
use crate::services::queue::{JobDelivery, JobQueue};
use crate::services::status::StatusPublisher;
use crate::services::workspace::ProjectWorkspace;

/// Longest error text carried in a `Failed` status message.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// How a delivery is settled once its job has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue { reason: String },
    DeadLetter { reason: String },
}

impl Disposition {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Ack => "completed",
            Self::Requeue { .. } => "requeued",
            Self::DeadLetter { .. } => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub worker_id: String,
    pub jobs_root: PathBuf,
    pub scratch_root: Option<PathBuf>,
    /// Attempts after which a retriable failure is dead-lettered.
    pub max_deliveries: u32,
    /// Interval of progress ticks while a stage runs, so the dashboard
    /// keeps seeing a busy worker.
    pub progress_interval: Duration,
}

pub struct JobProcessor {
    settings: ProcessorSettings,
    runner: Arc<dyn StageRunner>,
    status: Arc<dyn StatusPublisher>,
    progress: Arc<dyn ProgressReporter>,
}

impl JobProcessor {
    pub fn new(
        settings: ProcessorSettings,
        runner: Arc<dyn StageRunner>,
        status: Arc<dyn StatusPublisher>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            settings,
            runner,
            status,
            progress,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Run the reconstruction for one delivery and decide its settlement.
    ///
    /// The delivery is only acknowledged once the pipeline succeeded and the
    /// `Completed` transition reached the status queue.
    pub async fn handle(&self, project_id: i64, attempt: u32) -> Disposition {
        let started = Instant::now();
        info!(project_id, attempt, worker_id = %self.settings.worker_id, "Processing project");

        let update = StatusUpdate::processing(project_id, Utc::now()).with_attempt(attempt);
        if let Err(e) = self.status.publish(&update).await {
            warn!(project_id, error = %e, "Failed to publish Processing status");
        }
        self.report(project_id, VerboseState::Processing, |event| {
            event.with_step("Preparing workspace")
        })
        .await;

        let workspace = ProjectWorkspace::new(
            &self.settings.jobs_root,
            project_id,
            self.settings.scratch_root.as_deref(),
            &self.settings.worker_id,
        );
        let result = self.run_pipeline(&workspace, project_id).await;
        workspace.cleanup().await;

        let disposition = match result {
            Ok(mesh_path) => self.complete(project_id, attempt, mesh_path).await,
            Err(err) => self.fail(project_id, attempt, err).await,
        };

        metrics::histogram!("reconstruction_job_seconds").record(started.elapsed().as_secs_f64());
        disposition
    }

    async fn run_pipeline(&self, workspace: &ProjectWorkspace, project_id: i64) -> Result<String, JobError> {
        workspace.validate().await?;
        let image_count = workspace.prepare().await?;
        let image_count = u32::try_from(image_count).ok();
        info!(project_id, images = ?image_count, "Images flattened");

        let paths = workspace.paths();
        for stage in PipelineStage::all() {
            self.report(project_id, VerboseState::Processing, |event| {
                event.with_step(stage.step_label()).with_image_count(image_count)
            })
            .await;
            info!(project_id, stage = %stage, "{}", stage.step_label());

            let stage_started = Instant::now();
            let result = self.run_stage(project_id, stage, image_count, &paths).await;
            metrics::histogram!("reconstruction_stage_seconds", "stage" => stage.subcommand())
                .record(stage_started.elapsed().as_secs_f64());
            result?;
        }

        workspace.locate_mesh().await
    }

    /// Run one stage, re-announcing its step every `progress_interval`.
    async fn run_stage(
        &self,
        project_id: i64,
        stage: PipelineStage,
        image_count: Option<u32>,
        paths: &PipelinePaths,
    ) -> Result<(), JobError> {
        let invocation = stage.invocation(paths);
        let run = self.runner.run(&invocation);
        tokio::pin!(run);

        let period = self.settings.progress_interval.max(MIN_PROGRESS_INTERVAL);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick() => {
                    self.report(project_id, VerboseState::Processing, |event| {
                        event.with_step(stage.step_label()).with_image_count(image_count)
                    })
                    .await;
                }
            }
        }
    }

    async fn complete(&self, project_id: i64, attempt: u32, mesh_path: String) -> Disposition {
        let update = StatusUpdate::completed(project_id, mesh_path.clone(), Utc::now()).with_attempt(attempt);
        if let Err(e) = self.status.publish(&update).await {
            // The record would never learn about the mesh; run the job again.
            warn!(project_id, error = %e, "Failed to publish Completed status, requeuing");
            return Disposition::Requeue {
                reason: format!("{}: failed to publish Completed status: {}", e.failure_kind(), e),
            };
        }

        self.report(project_id, VerboseState::Completed, |event| {
            event.with_step("Completed").with_message(mesh_path.clone())
        })
        .await;
        info!(project_id, output = %mesh_path, "Project completed");
        Disposition::Ack
    }

    async fn fail(&self, project_id: i64, attempt: u32, err: JobError) -> Disposition {
        let message = truncate_chars(err.message(), MAX_ERROR_MESSAGE_CHARS);
        let reason = format!("{}: {}", err.kind(), message);

        let disposition = if err.is_retriable() && attempt < self.settings.max_deliveries {
            warn!(project_id, attempt, kind = %err.kind(), error = %message, "Retriable failure");
            Disposition::Requeue { reason }
        } else {
            error!(
                project_id,
                attempt,
                kind = %err.kind(),
                retriable = err.is_retriable(),
                error = %message,
                "Project failed"
            );
            Disposition::DeadLetter { reason }
        };

        let update = StatusUpdate::failed(project_id, message.clone(), Utc::now()).with_attempt(attempt);
        if let Err(e) = self.status.publish(&update).await {
            // Only this message moves the record out of Processing; run the job again.
            warn!(project_id, attempt, error = %e, "Failed to publish Failed status, requeuing");
            return Disposition::Requeue {
                reason: format!("{}: failed to publish Failed status: {}", e.failure_kind(), e),
            };
        }
        self.report(project_id, VerboseState::Failed, |event| event.with_message(message.clone()))
            .await;

        disposition
    }

    async fn report<F>(&self, project_id: i64, state: VerboseState, build: F)
    where
        F: FnOnce(VerboseStatus) -> VerboseStatus,
    {
        let event = VerboseStatus::new(project_id, state, &self.settings.worker_id, Utc::now());
        self.progress.report(build(event)).await;
    }
}

/// Prefix of `text` holding at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub consume_block_ms: u64,
    pub heartbeat_interval: Duration,
    pub consumer_timeout: Duration,
    pub reclaim_interval: Duration,
}

const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Broker loop: reclaim, consume, process, settle, heartbeat.
pub struct WorkerEngine {
    queue: JobQueue,
    processor: JobProcessor,
    progress: Arc<dyn ProgressReporter>,
    settings: EngineSettings,
}

impl WorkerEngine {
    pub fn new(
        queue: JobQueue,
        processor: JobProcessor,
        progress: Arc<dyn ProgressReporter>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            queue,
            processor,
            progress,
            settings,
        }
    }

    /// Run until `shutdown` flips to true. An in-flight job always finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let worker_id = self.processor.worker_id().to_string();
        let mut last_heartbeat: Option<Instant> = None;
        let mut last_reclaim: Option<Instant> = None;

        info!(worker_id = %worker_id, "Worker waiting for projects");

        while !*shutdown.borrow() {
            if last_heartbeat.map_or(true, |at| at.elapsed() >= self.settings.heartbeat_interval) {
                self.progress.report(VerboseStatus::heartbeat(&worker_id, Utc::now())).await;
                last_heartbeat = Some(Instant::now());
            }

            let reclaimed = if last_reclaim.map_or(true, |at| at.elapsed() >= self.settings.reclaim_interval) {
                last_reclaim = Some(Instant::now());
                self.reclaim(&worker_id).await
            } else {
                None
            };

            let delivery = match reclaimed {
                Some(delivery) => delivery,
                None => match self.queue.consume(&worker_id, self.settings.consume_block_ms).await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Failed to read from work queue");
                        tokio::select! {
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                            _ = shutdown.changed() => {}
                        }
                        continue;
                    }
                },
            };

            self.process(delivery).await;
            // Announce availability straight away.
            last_heartbeat = None;
            self.record_queue_depth().await;
        }

        info!(worker_id = %worker_id, "Worker stopped");
    }

    async fn reclaim(&self, worker_id: &str) -> Option<JobDelivery> {
        match self.queue.claim_stale(worker_id, self.settings.consumer_timeout).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to reclaim stale deliveries");
                None
            }
        }
    }

    async fn process(&self, delivery: JobDelivery) {
        let disposition = match delivery.job() {
            Ok(job) => self.processor.handle(job.project_id, delivery.attempt).await,
            Err(e) => {
                error!(message_id = %delivery.message_id, error = %e, "Malformed job payload");
                Disposition::DeadLetter {
                    reason: format!("invalid_input: malformed job payload: {}", e),
                }
            }
        };
        self.settle(&delivery, &disposition).await;
        metrics::counter!("reconstruction_jobs_total", "outcome" => disposition.outcome()).increment(1);
    }

    /// Broker failures here are logged and never change the job's outcome.
    async fn settle(&self, delivery: &JobDelivery, disposition: &Disposition) {
        let result = match disposition {
            Disposition::Ack => self.queue.ack(delivery).await,
            Disposition::Requeue { .. } => self.queue.requeue(delivery).await.map(|_| ()),
            Disposition::DeadLetter { reason } => self.queue.dead_letter(delivery, reason).await,
        };
        match result {
            Ok(()) => debug!(
                message_id = %delivery.message_id,
                outcome = disposition.outcome(),
                "Delivery settled"
            ),
            Err(e) => error!(
                message_id = %delivery.message_id,
                outcome = disposition.outcome(),
                error = %e,
                "Failed to settle delivery"
            ),
        }
    }

    async fn record_queue_depth(&self) {
        match self.queue.queue_depth().await {
            Ok(depth) => metrics::gauge!("work_queue_depth").set(depth as f64),
            Err(e) => debug!(error = %e, "Failed to read work queue depth"),
        }
    }
}
