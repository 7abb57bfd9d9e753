//! Terminal rendering of a [`DashboardSnapshot`].

use std::fmt::Write as _;

use chrono::{DateTime, Duration, Local, Utc};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use crate::models::status::VerboseState;
use crate::services::dashboard::{DashboardSnapshot, ProjectView, WorkerView};

const MAX_STEP_CHARS: usize = 40;

#[derive(Debug, Tabled)]
struct WorkerRow {
    #[tabled(rename = "Worker ID")]
    worker_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Current Project")]
    project: String,
    #[tabled(rename = "Current Step")]
    step: String,
    #[tabled(rename = "Elapsed Time")]
    elapsed: String,
    #[tabled(rename = "Images")]
    images: String,
    #[tabled(rename = "Last Update")]
    last_update: String,
}

impl WorkerRow {
    fn from_view(worker: &WorkerView, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker.worker_id.clone(),
            status: worker.status.to_string(),
            project: worker
                .current_project_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            step: truncate_step(&worker.current_step),
            elapsed: worker
                .processing_started
                .map_or_else(|| "-".to_string(), |started| format_elapsed(now - started)),
            images: count_or_dash(worker.image_count),
            last_update: clock(worker.last_update),
        }
    }

    fn placeholder() -> Self {
        Self {
            worker_id: "No workers connected".to_string(),
            status: String::new(),
            project: String::new(),
            step: String::new(),
            elapsed: String::new(),
            images: String::new(),
            last_update: String::new(),
        }
    }
}

#[derive(Debug, Tabled)]
struct ProjectRow {
    #[tabled(rename = "Project ID")]
    project_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Worker")]
    worker: String,
    #[tabled(rename = "Current Step")]
    step: String,
    #[tabled(rename = "Images")]
    images: String,
    #[tabled(rename = "Processing Time")]
    processing_time: String,
    #[tabled(rename = "Queued At")]
    queued_at: String,
}

impl ProjectRow {
    fn from_view(project: &ProjectView, now: DateTime<Utc>) -> Self {
        let step = match (&project.status, &project.error) {
            (VerboseState::Failed, Some(error)) => error.as_str(),
            _ => project.current_step.as_deref().unwrap_or_default(),
        };
        Self {
            project_id: project.project_id.to_string(),
            status: project.status.to_string(),
            worker: project.worker_id.clone().unwrap_or_else(|| "-".to_string()),
            step: truncate_step(step),
            images: count_or_dash(project.image_count),
            processing_time: project
                .processing_time(now)
                .map_or_else(|| "-".to_string(), format_elapsed),
            queued_at: clock(project.queued_at),
        }
    }

    fn placeholder() -> Self {
        Self {
            project_id: "No projects in queue".to_string(),
            status: String::new(),
            worker: String::new(),
            step: String::new(),
            images: String::new(),
            processing_time: String::new(),
            queued_at: String::new(),
        }
    }
}

/// Full dashboard screen: heading, worker table, project table and totals.
pub fn render_dashboard(snapshot: &DashboardSnapshot) -> String {
    let now = snapshot.taken_at;
    let mut out = String::new();

    let _ = writeln!(out, "{}", "Photogrammetry Processing Status".bold().cyan());
    let _ = writeln!(out);

    let mut workers: Vec<WorkerRow> = snapshot
        .workers
        .iter()
        .map(|worker| WorkerRow::from_view(worker, now))
        .collect();
    if workers.is_empty() {
        workers.push(WorkerRow::placeholder());
    }
    let _ = writeln!(out, "{}", "Workers".bold().blue());
    let _ = writeln!(out, "{}", Table::new(workers).with(Style::rounded()));
    let _ = writeln!(out);

    let mut projects: Vec<ProjectRow> = snapshot
        .projects
        .iter()
        .map(|project| ProjectRow::from_view(project, now))
        .collect();
    if projects.is_empty() {
        projects.push(ProjectRow::placeholder());
    }
    let _ = writeln!(out, "{}", "Recent Projects".bold().green());
    let _ = writeln!(out, "{}", Table::new(projects).with(Style::rounded()));
    let _ = writeln!(out);

    let stats = &snapshot.stats;
    let _ = writeln!(
        out,
        "{} {}",
        "Active Workers:".bold(),
        format!("{}/{}", stats.active_workers, stats.total_workers).green()
    );
    let _ = writeln!(out, "{} {}", "Queued Projects:".bold(), stats.queued.to_string().yellow());
    let _ = writeln!(out, "{} {}", "Processing:".bold(), stats.processing.to_string().green());
    let _ = writeln!(out, "{} {}", "Completed:".bold(), stats.completed.to_string().blue());
    let _ = writeln!(out, "{} {}", "Failed:".bold(), stats.failed.to_string().red());
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}",
        format!(
            "Last updated: {} | Press Ctrl+C to exit",
            now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        )
        .dimmed()
    );
    out
}

/// `1h 5m`, `3m 2s` or `42s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Step text limited to 40 characters; `-` when empty.
pub fn truncate_step(step: &str) -> String {
    if step.is_empty() {
        return "-".to_string();
    }
    if step.chars().count() > MAX_STEP_CHARS {
        let head: String = step.chars().take(MAX_STEP_CHARS - 3).collect();
        format!("{}...", head)
    } else {
        step.to_string()
    }
}

fn count_or_dash(count: u32) -> String {
    if count > 0 {
        count.to_string()
    } else {
        "-".to_string()
    }
}

fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}
