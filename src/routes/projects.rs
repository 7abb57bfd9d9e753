use std::path::{Component, Path as FsPath};

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use garde::Validate;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::project::{CreateProjectRequest, ProjectResponse, ProjectStatus};
use crate::models::status::{VerboseState, VerboseStatus};
use crate::routes::error::{ApiError, ApiResult};
use crate::services::upload::StagedUpload;

const LIST_LIMIT: i64 = 100;

/// POST /api/v1/projects: Upload a zip of photos and schedule reconstruction.
pub async fn create_project(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ProjectResponse>)> {
    let mut name: Option<String> = None;
    let mut archive: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => {
                let text = field.text().await.map_err(|e| ApiError::bad_request(e.body_text()))?;
                name = Some(text.trim().to_string());
            }
            Some("archive") => {
                let is_zip = field
                    .file_name()
                    .is_some_and(|file| file.to_ascii_lowercase().ends_with(".zip"));
                if !is_zip {
                    return Err(ApiError::bad_request("Only .zip archives are accepted"));
                }
                let data = field.bytes().await.map_err(|e| ApiError::bad_request(e.body_text()))?;
                archive = Some(data.to_vec());
            }
            _ => {}
        }
    }

    let request = CreateProjectRequest {
        name: name.ok_or_else(|| ApiError::bad_request("Missing 'name' field"))?,
    };
    request
        .validate()
        .map_err(|report| ApiError::bad_request(report.to_string()))?;
    let archive = archive.ok_or_else(|| ApiError::bad_request("Missing 'archive' file"))?;

    let staged = state.uploads.stage(archive).await?;

    let record = match queries::create_project(&state.db, &request.name, &staged.archive_key()).await {
        Ok(record) => record,
        Err(e) => {
            state.uploads.discard(&staged).await;
            return Err(e.into());
        }
    };

    if let Err(e) = state.uploads.promote(&staged, record.id).await {
        rollback(&state, &staged, record.id).await;
        return Err(e.into());
    }

    // Announced before enqueueing so a worker's first progress event always follows it.
    let image_count = u32::try_from(staged.image_count).ok();
    state
        .progress
        .report(VerboseStatus::queued(record.id, Utc::now()).with_image_count(image_count))
        .await;

    match state.queue.enqueue(record.id).await {
        Ok(message_id) => {
            info!(project_id = record.id, message_id = %message_id, images = staged.image_count, "Project queued");
        }
        Err(e) => {
            state
                .progress
                .report(
                    VerboseStatus::new(record.id, VerboseState::Failed, "", Utc::now())
                        .with_message("Could not be scheduled"),
                )
                .await;
            rollback(&state, &staged, record.id).await;
            return Err(e.into());
        }
    }

    metrics::counter!("projects_created_total").increment(1);

    Ok((
        StatusCode::CREATED,
        Json(ProjectResponse::from_record(record, &state.base_url)),
    ))
}

/// Undo a partially created project so no record exists without scheduled work.
async fn rollback(state: &AppState, staged: &StagedUpload, project_id: i64) {
    if let Err(e) = queries::delete_project(&state.db, project_id).await {
        warn!(project_id, error = %e, "Failed to delete unscheduled project");
    }
    state.uploads.remove_project_dir(project_id).await;
    state.uploads.discard(staged).await;
}

/// GET /api/v1/projects: Most recent projects.
pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<ProjectResponse>>> {
    let records = queries::list_projects(&state.db, LIST_LIMIT).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|record| ProjectResponse::from_record(record, &state.base_url))
            .collect(),
    ))
}

/// GET /api/v1/projects/{id}: Project status.
pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<ProjectResponse>> {
    let record = queries::get_project(&state.db, project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Project {} not found", project_id)))?;
    Ok(Json(ProjectResponse::from_record(record, &state.base_url)))
}

/// GET /api/v1/projects/{id}/download: The reconstructed mesh.
pub async fn download_model(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let record = queries::get_project(&state.db, project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Project {} not found", project_id)))?;

    if record.status != ProjectStatus::Finished {
        return Err(ApiError::bad_request(format!(
            "Project {} is not finished (status: {})",
            project_id, record.status
        )));
    }

    let relative = record
        .output_model_path
        .as_deref()
        .filter(|path| is_contained(FsPath::new(path)))
        .ok_or_else(|| ApiError::not_found("Model file not found"))?;
    let path = state.uploads.jobs_root().join(relative);

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("Model file not found"));
        }
        Err(e) => return Err(e.into()),
    };

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("project_{}.ply", project_id));

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        data,
    ))
}

/// Relative path that cannot leave the jobs root.
fn is_contained(path: &FsPath) -> bool {
    path.components().all(|component| matches!(component, Component::Normal(_)))
}
