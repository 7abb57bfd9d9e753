//! Live view of workers and projects built from the verbose status stream.
//!
//! All state sits behind a single lock and is reached only through
//! [`DashboardReconciler::apply_update`] and [`DashboardReconciler::render_snapshot`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::status::{VerboseState, VerboseStatus};

/// Workers silent for longer than this are dropped.
pub const STALE_WORKER_AFTER: StdDuration = StdDuration::from_secs(5 * 60);

/// Workers stuck in `Processing` without updates for longer than this are dropped.
pub const STUCK_WORKER_AFTER: StdDuration = StdDuration::from_secs(2 * 60);

pub const DEFAULT_RECENT_PROJECTS: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub status: VerboseState,
    pub current_project_id: Option<i64>,
    pub current_step: String,
    pub processing_started: Option<DateTime<Utc>>,
    pub image_count: u32,
    pub last_update: DateTime<Utc>,
    pub message: Option<String>,
}

impl WorkerView {
    fn new(worker_id: &str, seen_at: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            status: VerboseState::Idle,
            current_project_id: None,
            current_step: String::new(),
            processing_started: None,
            image_count: 0,
            last_update: seen_at,
            message: None,
        }
    }

    fn reset_to_idle(&mut self) {
        self.status = VerboseState::Idle;
        self.current_project_id = None;
        self.current_step.clear();
        self.processing_started = None;
        self.image_count = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectView {
    pub project_id: i64,
    pub name: String,
    pub status: VerboseState,
    pub worker_id: Option<String>,
    pub current_step: Option<String>,
    pub image_count: u32,
    /// First time any message for this project was seen.
    pub queued_at: DateTime<Utc>,
    pub processing_started: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ProjectView {
    fn new(project_id: i64, seen_at: DateTime<Utc>) -> Self {
        Self {
            project_id,
            name: format!("Project {}", project_id),
            status: VerboseState::InQueue,
            worker_id: None,
            current_step: None,
            image_count: 0,
            queued_at: seen_at,
            processing_started: None,
            completed_at: None,
            error: None,
        }
    }

    /// Time spent processing, up to completion or `now`.
    pub fn processing_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.processing_started
            .map(|started| self.completed_at.unwrap_or(now) - started)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardStats {
    pub active_workers: usize,
    pub total_workers: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Sorted by worker id.
    pub workers: Vec<WorkerView>,
    /// Most recently queued first.
    pub projects: Vec<ProjectView>,
    pub stats: DashboardStats,
}

#[derive(Debug, Default)]
struct DashboardState {
    workers: HashMap<String, WorkerView>,
    projects: HashMap<i64, ProjectView>,
}

impl DashboardState {
    fn apply(&mut self, msg: &VerboseStatus) {
        if !msg.worker_id.is_empty() {
            self.apply_worker(msg);
        }
        if !msg.is_heartbeat() {
            self.apply_project(msg);
        }
    }

    fn apply_worker(&mut self, msg: &VerboseStatus) {
        if msg.status == VerboseState::Processing {
            // Last claim wins: no other worker keeps this project.
            for other in self.workers.values_mut() {
                if other.worker_id != msg.worker_id && other.current_project_id == Some(msg.project_id) {
                    other.reset_to_idle();
                }
            }
        }

        let worker = self
            .workers
            .entry(msg.worker_id.clone())
            .or_insert_with(|| WorkerView::new(&msg.worker_id, msg.timestamp));
        worker.last_update = msg.timestamp;
        worker.status = msg.status;
        worker.current_step = msg.current_step.clone().unwrap_or_default();
        worker.message = msg.message.clone();

        if msg.status == VerboseState::Processing {
            if worker.current_project_id != Some(msg.project_id) {
                worker.processing_started = None;
            }
            worker.current_project_id = Some(msg.project_id);
            worker.processing_started.get_or_insert(msg.timestamp);
            worker.image_count = msg.image_count.unwrap_or(0);
        } else if msg.status.releases_worker() {
            worker.reset_to_idle();
        }
    }

    fn apply_project(&mut self, msg: &VerboseStatus) {
        let project = self
            .projects
            .entry(msg.project_id)
            .or_insert_with(|| ProjectView::new(msg.project_id, msg.timestamp));
        let previous = project.status;
        project.status = msg.status;
        if !msg.worker_id.is_empty() {
            project.worker_id = Some(msg.worker_id.clone());
        }
        project.current_step = msg.current_step.clone();
        if let Some(count) = msg.image_count {
            project.image_count = count;
        }

        match msg.status {
            VerboseState::Processing => {
                if matches!(previous, VerboseState::Failed | VerboseState::InQueue) {
                    // New attempt.
                    project.processing_started = Some(msg.timestamp);
                    project.completed_at = None;
                    project.error = None;
                } else {
                    project.processing_started.get_or_insert(msg.timestamp);
                }
            }
            VerboseState::Completed => project.completed_at = Some(msg.timestamp),
            VerboseState::Failed => {
                project.completed_at = Some(msg.timestamp);
                project.error = msg.message.clone();
            }
            _ => {}
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        self.workers
            .retain(|_, worker| !silent_longer_than(worker, now, STALE_WORKER_AFTER));
        self.workers.retain(|_, worker| {
            worker.status != VerboseState::Processing || !silent_longer_than(worker, now, STUCK_WORKER_AFTER)
        });

        let queued = self
            .projects
            .values()
            .filter(|project| project.status == VerboseState::InQueue)
            .count();
        let mut idle: Vec<(DateTime<Utc>, String)> = self
            .workers
            .values()
            .filter(|worker| worker.status == VerboseState::Idle)
            .map(|worker| (worker.last_update, worker.worker_id.clone()))
            .collect();
        if idle.len() > queued {
            idle.sort();
            let surplus = idle.len() - queued;
            for (_, worker_id) in idle.into_iter().take(surplus) {
                self.workers.remove(&worker_id);
            }
        }
    }

    fn snapshot(&self, now: DateTime<Utc>, recent_projects: usize) -> DashboardSnapshot {
        let mut workers: Vec<WorkerView> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let mut projects: Vec<ProjectView> = self.projects.values().cloned().collect();
        projects.sort_by(|a, b| {
            b.queued_at
                .cmp(&a.queued_at)
                .then_with(|| b.project_id.cmp(&a.project_id))
        });
        projects.truncate(recent_projects);

        let count = |state: VerboseState| self.projects.values().filter(|p| p.status == state).count();
        let stats = DashboardStats {
            active_workers: workers
                .iter()
                .filter(|w| w.status == VerboseState::Processing)
                .count(),
            total_workers: workers.len(),
            queued: count(VerboseState::InQueue),
            processing: count(VerboseState::Processing),
            completed: count(VerboseState::Completed),
            failed: count(VerboseState::Failed),
        };

        DashboardSnapshot {
            taken_at: now,
            workers,
            projects,
            stats,
        }
    }
}

fn silent_longer_than(worker: &WorkerView, now: DateTime<Utc>, limit: StdDuration) -> bool {
    (now - worker.last_update)
        .to_std()
        .is_ok_and(|silent| silent > limit)
}

/// Owner of the dashboard's worker and project views.
pub struct DashboardReconciler {
    state: Mutex<DashboardState>,
    recent_projects: usize,
}

impl Default for DashboardReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_PROJECTS)
    }
}

impl DashboardReconciler {
    pub fn new(recent_projects: usize) -> Self {
        Self {
            state: Mutex::new(DashboardState::default()),
            recent_projects,
        }
    }

    pub fn apply_update(&self, msg: &VerboseStatus) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(msg);
    }

    /// Evict stale, stuck and surplus idle workers, then capture the views.
    pub fn render_snapshot(&self, now: DateTime<Utc>) -> DashboardSnapshot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.evict(now);
        state.snapshot(now, self.recent_projects)
    }
}
