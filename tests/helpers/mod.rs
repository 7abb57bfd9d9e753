//! Shared fakes for the worker and status consumer tests, plus HTTP helpers
//! for the end-to-end tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

use photogrammetry_pipeline::{
    db::store::{ProjectStore, StoreError},
    models::{
        project::{ProjectRecord, ProjectStatus},
        status::{AuthoritativeStatus, StatusUpdate, VerboseStatus},
    },
    services::{
        failure::{FailureKind, JobError},
        pipeline::{PipelineStage, StageInvocation, StageRunner},
        progress::ProgressReporter,
        queue::QueueError,
        status::StatusPublisher,
    },
};

/// Project table kept in memory.
#[derive(Default)]
pub struct InMemoryProjectStore {
    projects: Mutex<HashMap<i64, ProjectRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryProjectStore {
    pub fn insert(&self, record: ProjectRecord) {
        self.projects.lock().unwrap().insert(record.id, record);
    }

    pub fn get(&self, id: i64) -> Option<ProjectRecord> {
        self.projects.lock().unwrap().get(&id).cloned()
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("database offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn find_project(&self, id: i64) -> Result<Option<ProjectRecord>, StoreError> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn update_project(&self, record: &ProjectRecord) -> Result<(), StoreError> {
        self.check()?;
        self.insert(record.clone());
        Ok(())
    }
}

/// Captures authoritative status messages; can be told to fail `Completed`
/// or `Failed`.
#[derive(Default)]
pub struct RecordingStatusPublisher {
    published: Mutex<Vec<StatusUpdate>>,
    fail_completed: AtomicBool,
    fail_failed: AtomicBool,
}

impl RecordingStatusPublisher {
    pub fn published(&self) -> Vec<StatusUpdate> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail_completed(&self, fail: bool) {
        self.fail_completed.store(fail, Ordering::SeqCst);
    }

    pub fn fail_failed(&self, fail: bool) {
        self.fail_failed.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusPublisher for RecordingStatusPublisher {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), QueueError> {
        let fail = match update.status {
            AuthoritativeStatus::Completed => self.fail_completed.load(Ordering::SeqCst),
            AuthoritativeStatus::Failed => self.fail_failed.load(Ordering::SeqCst),
            AuthoritativeStatus::Processing => false,
        };
        if fail {
            return Err(QueueError::TopologyMissing("status queue unreachable".to_string()));
        }
        self.published.lock().unwrap().push(update.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<VerboseStatus>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<VerboseStatus> {
        self.events.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| event.current_step)
            .collect()
    }
}

#[async_trait]
impl ProgressReporter for RecordingProgress {
    async fn report(&self, status: VerboseStatus) {
        self.events.lock().unwrap().push(status);
    }
}

/// Stage runner that records invocations, writes the mesh on the last stage
/// and fails scripted stages.
#[derive(Default)]
pub struct ScriptedRunner {
    failures: Mutex<HashMap<PipelineStage, Vec<JobError>>>,
    ran: Mutex<Vec<PipelineStage>>,
    skip_mesh: AtomicBool,
    delays: Mutex<HashMap<PipelineStage, Duration>>,
}

impl ScriptedRunner {
    /// Fail the next run of `stage` with `kind`. Queued failures are consumed in order.
    pub fn fail_at(&self, stage: PipelineStage, kind: FailureKind, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push(JobError::new(kind, message));
    }

    /// Let the mesher succeed without writing any output.
    pub fn skip_mesh(&self) {
        self.skip_mesh.store(true, Ordering::SeqCst);
    }

    /// Make every run of `stage` take at least `delay`.
    pub fn slow_stage(&self, stage: PipelineStage, delay: Duration) {
        self.delays.lock().unwrap().insert(stage, delay);
    }

    pub fn ran(&self) -> Vec<PipelineStage> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run(&self, invocation: &StageInvocation) -> Result<(), JobError> {
        self.ran.lock().unwrap().push(invocation.stage);

        let delay = self.delays.lock().unwrap().get(&invocation.stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            failures
                .get_mut(&invocation.stage)
                .and_then(|queued| (!queued.is_empty()).then(|| queued.remove(0)))
        };
        if let Some(err) = scripted {
            return Err(err);
        }

        if invocation.stage == PipelineStage::PoissonMesher && !self.skip_mesh.load(Ordering::SeqCst) {
            let mesh = output_path(invocation).expect("mesher invocation has an output path");
            tokio::fs::create_dir_all(mesh.parent().unwrap()).await.unwrap();
            tokio::fs::write(&mesh, b"ply\nformat ascii 1.0\nend_header\n").await.unwrap();
        }
        Ok(())
    }
}

fn output_path(invocation: &StageInvocation) -> Option<PathBuf> {
    let position = invocation.args.iter().position(|arg| arg == "--output_path")?;
    invocation.args.get(position + 1).map(PathBuf::from)
}

pub fn in_queue_record(id: i64) -> ProjectRecord {
    ProjectRecord {
        id,
        name: format!("Survey {}", id),
        status: ProjectStatus::InQueue,
        zip_file_path: format!("uploads/{}.zip", id),
        output_model_path: None,
        created_at: chrono::Utc::now() - chrono::Duration::minutes(10),
        processing_started_at: None,
        completed_at: None,
        error_message: None,
        status_attempt: 0,
    }
}

/// Project as returned by the API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectResponse {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub error_message: Option<String>,
    pub download_url: Option<String>,
}

/// Upload a photo archive to POST /api/v1/projects
pub async fn create_project(
    client: &reqwest::Client,
    base_url: &str,
    name: &str,
    archive: Vec<u8>,
) -> Result<reqwest::Response, reqwest::Error> {
    let form = multipart::Form::new().text("name", name.to_string()).part(
        "archive",
        multipart::Part::bytes(archive)
            .file_name("photos.zip")
            .mime_str("application/zip")?,
    );

    client
        .post(format!("{}/api/v1/projects", base_url))
        .multipart(form)
        .send()
        .await
}

/// Poll GET /api/v1/projects/{id} until the project reaches a terminal status
pub async fn wait_for_terminal_status(
    client: &reqwest::Client,
    base_url: &str,
    project_id: i64,
    timeout: Duration,
) -> Result<ProjectResponse, Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let project: ProjectResponse = client
            .get(format!("{}/api/v1/projects/{}", base_url, project_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if project.status == "Finished" || project.status == "Failed" {
            return Ok(project);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("project {} still {} after {:?}", project_id, project.status, timeout).into());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
