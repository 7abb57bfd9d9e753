use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::db::store::{ProjectStore, StoreError};
use crate::models::project::{ProjectRecord, ProjectStatus};

const PROJECT_COLUMNS: &str = "id, name, status, zip_file_path, output_model_path, created_at, \
     processing_started_at, completed_at, error_message, status_attempt";

/// Insert a new project in `InQueue`
pub async fn create_project(pool: &PgPool, name: &str, zip_file_path: &str) -> Result<ProjectRecord, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO projects (name, status, zip_file_path) VALUES ($1, $2, $3) RETURNING {}",
        PROJECT_COLUMNS
    ))
    .bind(name)
    .bind(ProjectStatus::InQueue.as_ref())
    .bind(zip_file_path)
    .fetch_one(pool)
    .await?;

    record_from_row(&row)
}

/// Get a project by ID
pub async fn get_project(pool: &PgPool, id: i64) -> Result<Option<ProjectRecord>, StoreError> {
    let row = sqlx::query(&format!("SELECT {} FROM projects WHERE id = $1", PROJECT_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Most recently created projects first
pub async fn list_projects(pool: &PgPool, limit: i64) -> Result<Vec<ProjectRecord>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM projects ORDER BY created_at DESC, id DESC LIMIT $1",
        PROJECT_COLUMNS
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Overwrite the status columns of a project
pub async fn update_project(pool: &PgPool, record: &ProjectRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE projects
        SET status = $2,
            output_model_path = $3,
            processing_started_at = $4,
            completed_at = $5,
            error_message = $6,
            status_attempt = $7
        WHERE id = $1
        "#,
    )
    .bind(record.id)
    .bind(record.status.as_ref())
    .bind(&record.output_model_path)
    .bind(record.processing_started_at)
    .bind(record.completed_at)
    .bind(&record.error_message)
    .bind(i32::try_from(record.status_attempt).unwrap_or(i32::MAX))
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove a project whose creation could not be completed
pub async fn delete_project(pool: &PgPool, id: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM projects WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

fn record_from_row(row: &PgRow) -> Result<ProjectRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ProjectStatus::from_str(&status).map_err(|_| StoreError::InvalidStatus(status))?;
    let status_attempt: i32 = row.try_get("status_attempt")?;

    Ok(ProjectRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status,
        zip_file_path: row.try_get("zip_file_path")?,
        output_model_path: row.try_get("output_model_path")?,
        created_at: row.try_get("created_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        status_attempt: u32::try_from(status_attempt).unwrap_or_default(),
    })
}

/// [`ProjectStore`] backed by the `projects` table.
#[derive(Clone)]
pub struct PgProjectStore {
    pool: PgPool,
}

impl PgProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn find_project(&self, id: i64) -> Result<Option<ProjectRecord>, StoreError> {
        get_project(&self.pool, id).await
    }

    async fn update_project(&self, record: &ProjectRecord) -> Result<(), StoreError> {
        update_project(&self.pool, record).await
    }
}
