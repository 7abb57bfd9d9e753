use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use image::ImageFormat;
use tracing::{debug, warn};

use crate::services::failure::{FailureKind, JobError};
use crate::services::pipeline::{PipelinePaths, FUSED_POINT_CLOUD};

/// Fewest photos a reconstruction is attempted with.
pub const MIN_IMAGES: usize = 3;

/// Mesh extensions searched for after the pipeline, most preferred first.
pub const MESH_EXTENSIONS: [&str; 5] = ["obj", "ply", "fbx", "gltf", "glb"];

/// Whether a file is a photo the pipeline accepts (JPEG or PNG).
pub fn is_supported_image(path: &Path) -> bool {
    matches!(
        ImageFormat::from_path(path),
        Ok(ImageFormat::Jpeg) | Ok(ImageFormat::Png)
    )
}

/// On-disk layout of one project under the shared jobs root.
///
/// ```text
/// {jobs_root}/project_{id}/images        uploaded photos, possibly nested
/// {jobs_root}/project_{id}/flat_images   rebuilt for every attempt
/// {jobs_root}/project_{id}/output/{sparse,dense}
/// {scratch_root}/{worker_id}/project_{id}/database.db   when scratch is configured
/// ```
#[derive(Debug, Clone)]
pub struct ProjectWorkspace {
    jobs_root: PathBuf,
    root: PathBuf,
    scratch: Option<PathBuf>,
}

impl ProjectWorkspace {
    pub fn new(jobs_root: &Path, project_id: i64, scratch_root: Option<&Path>, worker_id: &str) -> Self {
        let dir_name = format!("project_{}", project_id);
        Self {
            jobs_root: jobs_root.to_path_buf(),
            root: jobs_root.join(&dir_name),
            scratch: scratch_root.map(|scratch| scratch.join(worker_id).join(&dir_name)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn flat_images_dir(&self) -> PathBuf {
        self.root.join("flat_images")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_deref()
    }

    pub fn database_path(&self) -> PathBuf {
        self.scratch.as_deref().unwrap_or(&self.root).join("database.db")
    }

    pub fn paths(&self) -> PipelinePaths {
        PipelinePaths::new(self.flat_images_dir(), self.database_path(), &self.output_dir())
    }

    /// The project directory must exist; its absence is permanent.
    pub async fn validate(&self) -> Result<(), JobError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(JobError::new(
                FailureKind::DirectoryMissing,
                format!("Project path is not a directory: {}", self.root.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(JobError::new(
                FailureKind::DirectoryMissing,
                format!("Project directory not found: {}", self.root.display()),
            )),
            Err(e) => Err(JobError::io(format!("Inspecting {}", self.root.display()), e)),
        }
    }

    /// Flatten the photos and create the output layout. Returns the image count.
    pub async fn prepare(&self) -> Result<usize, JobError> {
        let workspace = self.clone();
        tokio::task::spawn_blocking(move || workspace.prepare_blocking()).await?
    }

    fn prepare_blocking(&self) -> Result<usize, JobError> {
        let images = self.images_dir();
        if !images.is_dir() {
            return Err(JobError::new(
                FailureKind::InputNotReady,
                format!("Images directory not found: {}", images.display()),
            ));
        }

        let flat = self.flat_images_dir();
        if flat.exists() {
            fs::remove_dir_all(&flat).map_err(|e| JobError::io(format!("Removing {}", flat.display()), e))?;
        }
        fs::create_dir_all(&flat).map_err(|e| JobError::io(format!("Creating {}", flat.display()), e))?;

        flatten_images(&images, &flat)?;
        let count = fs::read_dir(&flat)
            .map_err(|e| JobError::io(format!("Reading {}", flat.display()), e))?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .count();
        if count < MIN_IMAGES {
            return Err(JobError::new(
                FailureKind::InvalidInput,
                format!("Found {} images, at least {} are required", count, MIN_IMAGES),
            ));
        }

        let output = self.output_dir();
        for dir in [output.join("sparse"), output.join("dense")] {
            fs::create_dir_all(&dir).map_err(|e| JobError::io(format!("Creating {}", dir.display()), e))?;
        }
        if let Some(scratch) = &self.scratch {
            fs::create_dir_all(scratch).map_err(|e| JobError::io(format!("Creating {}", scratch.display()), e))?;
        }

        debug!(project_dir = %self.root.display(), images = count, "Workspace prepared");
        Ok(count)
    }

    /// Find the produced mesh and return its path relative to the jobs root.
    pub async fn locate_mesh(&self) -> Result<String, JobError> {
        let workspace = self.clone();
        tokio::task::spawn_blocking(move || workspace.locate_mesh_blocking()).await?
    }

    fn locate_mesh_blocking(&self) -> Result<String, JobError> {
        let expected = self.paths().mesh;
        let mesh = if expected.is_file() {
            Some(expected)
        } else {
            let mut candidates = Vec::new();
            collect_files(&self.output_dir(), &mut candidates)
                .map_err(|e| JobError::io(format!("Searching {}", self.output_dir().display()), e))?;
            select_mesh(candidates)
        };

        let mesh = mesh.ok_or_else(|| {
            JobError::new(
                FailureKind::OutputMissing,
                format!("No mesh produced under {}", self.output_dir().display()),
            )
        })?;
        Ok(relative_to(&self.jobs_root, &mesh))
    }

    /// Remove the per-worker scratch directory. Failures are logged only.
    pub async fn cleanup(&self) {
        let Some(scratch) = &self.scratch else {
            return;
        };
        match tokio::fs::remove_dir_all(scratch).await {
            Ok(()) => debug!(scratch = %scratch.display(), "Removed scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(scratch = %scratch.display(), error = %e, "Failed to remove scratch directory"),
        }
    }
}

/// Copy every accepted photo below `source` into `target`. Later duplicates
/// of a file name overwrite earlier ones.
fn flatten_images(source: &Path, target: &Path) -> Result<(), JobError> {
    let mut files = Vec::new();
    collect_files(source, &mut files).map_err(|e| JobError::io(format!("Reading {}", source.display()), e))?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    for (path, _) in files.iter().filter(|(path, _)| is_supported_image(path)) {
        if let Some(name) = path.file_name() {
            fs::copy(path, target.join(name)).map_err(|e| JobError::io(format!("Copying {}", path.display()), e))?;
        }
    }
    Ok(())
}

/// Recursively list regular files with their sizes.
fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push((entry.path(), entry.metadata()?.len()));
        }
    }
    Ok(())
}

/// Largest file of the most preferred mesh extension present. The fused
/// point cloud shares the `ply` extension and is never a candidate.
fn select_mesh(candidates: Vec<(PathBuf, u64)>) -> Option<PathBuf> {
    MESH_EXTENSIONS.iter().find_map(|wanted| {
        candidates
            .iter()
            .filter(|(path, _)| path.file_name().map_or(true, |name| name != FUSED_POINT_CLOUD))
            .filter(|(path, _)| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
            })
            .max_by_key(|(_, size)| *size)
            .map(|(path, _)| path.clone())
    })
}

/// `/`-separated path of `path` below `base`.
fn relative_to(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
