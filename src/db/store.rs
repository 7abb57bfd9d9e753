use async_trait::async_trait;

use crate::models::project::ProjectRecord;

/// Persistence port used by the status consumer.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_project(&self, id: i64) -> Result<Option<ProjectRecord>, StoreError>;

    /// Overwrite the mutable fields of an existing project.
    async fn update_project(&self, record: &ProjectRecord) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid project status in storage: {0}")]
    InvalidStatus(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
