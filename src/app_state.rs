use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{progress::ProgressReporter, queue::JobQueue, upload::UploadStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub progress: Arc<dyn ProgressReporter>,
    pub uploads: Arc<UploadStore>,
    /// Public base URL for download links
    pub base_url: Arc<str>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: JobQueue,
        progress: Arc<dyn ProgressReporter>,
        uploads: UploadStore,
        base_url: &str,
    ) -> Self {
        Self {
            db,
            queue: Arc::new(queue),
            progress,
            uploads: Arc::new(uploads),
            base_url: Arc::from(base_url),
        }
    }
}
