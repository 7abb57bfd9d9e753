//! Staging of uploaded photo archives into project working directories.
//!
//! An archive is written to `uploads/{uuid}.zip` under the jobs root and its
//! photos extracted next to it. Once the project record exists the extracted
//! photos are moved to `project_{id}/images` where workers pick them up.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::workspace::{is_supported_image, MIN_IMAGES};

const UPLOADS_DIR: &str = "uploads";

/// An archive accepted and extracted, not yet attached to a project.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub id: Uuid,
    pub archive_path: PathBuf,
    pub extracted_dir: PathBuf,
    pub image_count: usize,
}

impl StagedUpload {
    /// Archive location relative to the jobs root, as stored on the record.
    pub fn archive_key(&self) -> String {
        format!("{}/{}.zip", UPLOADS_DIR, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    jobs_root: PathBuf,
}

impl UploadStore {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
        }
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    pub fn project_dir(&self, project_id: i64) -> PathBuf {
        self.jobs_root.join(format!("project_{}", project_id))
    }

    /// Store and extract an archive. Rejects archives with too few photos.
    pub async fn stage(&self, archive: Vec<u8>) -> Result<StagedUpload, UploadError> {
        let uploads = self.jobs_root.join(UPLOADS_DIR);
        let result = tokio::task::spawn_blocking(move || stage_blocking(&uploads, &archive))
            .await
            .map_err(|e| UploadError::Io(io::Error::other(e)))?;

        match result {
            Ok(staged) => {
                debug!(upload_id = %staged.id, images = staged.image_count, "Upload staged");
                Ok(staged)
            }
            Err((staged, err)) => {
                if let Some(staged) = staged {
                    self.discard(&staged).await;
                }
                Err(err)
            }
        }
    }

    /// Move the extracted photos to `project_{id}/images`.
    pub async fn promote(&self, staged: &StagedUpload, project_id: i64) -> Result<PathBuf, UploadError> {
        let project_dir = self.project_dir(project_id);
        let images = project_dir.join("images");
        tokio::fs::create_dir_all(&project_dir).await?;
        tokio::fs::rename(&staged.extracted_dir, &images).await?;
        debug!(upload_id = %staged.id, project_id, "Upload promoted to project directory");
        Ok(images)
    }

    /// Remove everything an upload left behind. Failures are logged only.
    pub async fn discard(&self, staged: &StagedUpload) {
        for result in [
            tokio::fs::remove_dir_all(&staged.extracted_dir).await,
            tokio::fs::remove_file(&staged.archive_path).await,
        ] {
            if let Err(e) = result {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(upload_id = %staged.id, error = %e, "Failed to remove upload artifacts");
                }
            }
        }
    }

    /// Remove a project's working directory after a failed creation.
    pub async fn remove_project_dir(&self, project_id: i64) {
        let dir = self.project_dir(project_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(project_id, error = %e, "Failed to remove project directory");
            }
        }
    }
}

type StageResult = Result<StagedUpload, (Option<StagedUpload>, UploadError)>;

fn stage_blocking(uploads: &Path, archive: &[u8]) -> StageResult {
    fs::create_dir_all(uploads).map_err(|e| (None, e.into()))?;

    let id = Uuid::new_v4();
    let mut staged = StagedUpload {
        id,
        archive_path: uploads.join(format!("{}.zip", id)),
        extracted_dir: uploads.join(id.to_string()),
        image_count: 0,
    };

    fs::write(&staged.archive_path, archive).map_err(|e| (Some(staged.clone()), e.into()))?;
    match extract_images(&staged.archive_path, &staged.extracted_dir) {
        Ok(count) if count >= MIN_IMAGES => {
            staged.image_count = count;
            Ok(staged)
        }
        Ok(count) => Err((
            Some(staged),
            UploadError::TooFewImages {
                found: count,
                required: MIN_IMAGES,
            },
        )),
        Err(e) => Err((Some(staged), e)),
    }
}

/// Extract the photos in `archive` below `target`, keeping folder structure.
fn extract_images(archive: &Path, target: &Path) -> Result<usize, UploadError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(target)?;

    let mut count = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        // Entries escaping the target directory have no enclosed name.
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        if is_metadata_entry(&relative) || !is_supported_image(&relative) {
            continue;
        }

        let destination = target.join(&relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&destination)?;
        io::copy(&mut entry, &mut out)?;
        count += 1;
    }
    Ok(count)
}

/// Resource forks and dot-files added by archivers.
fn is_metadata_entry(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part == "__MACOSX" || part.starts_with('.')
        }
        _ => false,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Archive contains {found} images, at least {required} are required")]
    TooFewImages { found: usize, required: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[&str]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for name in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(b"photo").unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_stage_extracts_only_photos() {
        let jobs = TempDir::new().unwrap();
        let store = UploadStore::new(jobs.path());
        let staged = store
            .stage(archive(&[
                "a.jpg",
                "set/b.png",
                "set/c.JPG",
                "readme.txt",
                "__MACOSX/set/._c.JPG",
            ]))
            .await
            .unwrap();

        assert_eq!(staged.image_count, 3);
        assert!(staged.archive_path.is_file());
        assert!(staged.extracted_dir.join("set/b.png").is_file());
        assert!(!staged.extracted_dir.join("readme.txt").exists());
        assert!(staged.archive_key().starts_with("uploads/"));
    }

    #[tokio::test]
    async fn test_stage_rejects_too_few_photos_and_cleans_up() {
        let jobs = TempDir::new().unwrap();
        let store = UploadStore::new(jobs.path());
        let err = store.stage(archive(&["a.jpg", "b.jpg"])).await.unwrap_err();
        assert!(matches!(err, UploadError::TooFewImages { found: 2, required: 3 }));
        let leftovers = fs::read_dir(jobs.path().join(UPLOADS_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_stage_rejects_non_zip() {
        let jobs = TempDir::new().unwrap();
        let store = UploadStore::new(jobs.path());
        let err = store.stage(b"not a zip".to_vec()).await.unwrap_err();
        assert!(matches!(err, UploadError::Archive(_)));
    }

    #[tokio::test]
    async fn test_promote_moves_photos_into_project() {
        let jobs = TempDir::new().unwrap();
        let store = UploadStore::new(jobs.path());
        let staged = store.stage(archive(&["a.jpg", "b.jpg", "nested/c.jpg"])).await.unwrap();

        let images = store.promote(&staged, 41).await.unwrap();
        assert_eq!(images, jobs.path().join("project_41").join("images"));
        assert!(images.join("nested/c.jpg").is_file());
        assert!(!staged.extracted_dir.exists());
    }
}
