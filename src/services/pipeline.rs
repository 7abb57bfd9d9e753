//! The seven-stage COLMAP reconstruction pipeline.
//!
//! Stages are opaque external processes run strictly in order; the first
//! non-zero exit aborts the rest.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::services::failure::{FailureKind, JobError};

/// Number of trailing stderr lines kept for the error message.
pub const STDERR_TAIL_LINES: usize = 20;

/// File name of the mesh written by the last stage.
pub const MESH_FILE_NAME: &str = "meshed-poisson.ply";

/// File name of the point cloud written by stereo fusion. Not a mesh.
pub const FUSED_POINT_CLOUD: &str = "fused.ply";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStage {
    FeatureExtractor,
    ExhaustiveMatcher,
    Mapper,
    ImageUndistorter,
    PatchMatchStereo,
    StereoFusion,
    PoissonMesher,
}

impl PipelineStage {
    pub const COUNT: usize = 7;

    pub fn all() -> impl Iterator<Item = PipelineStage> {
        Self::iter()
    }

    /// 1-based position in the pipeline.
    pub fn number(self) -> usize {
        Self::iter().position(|stage| stage == self).unwrap_or(0) + 1
    }

    /// COLMAP subcommand name.
    pub fn subcommand(self) -> &'static str {
        self.into()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::FeatureExtractor => "Feature extraction",
            Self::ExhaustiveMatcher => "Feature matching",
            Self::Mapper => "Sparse reconstruction",
            Self::ImageUndistorter => "Image undistortion",
            Self::PatchMatchStereo => "Dense stereo matching",
            Self::StereoFusion => "Stereo fusion",
            Self::PoissonMesher => "Poisson meshing",
        }
    }

    /// Progress text shown on the dashboard, e.g. `Step 3/7: Sparse reconstruction`.
    pub fn step_label(self) -> String {
        format!("Step {}/{}: {}", self.number(), Self::COUNT, self.label())
    }

    pub fn invocation(self, paths: &PipelinePaths) -> StageInvocation {
        let fused = paths.dense.join(FUSED_POINT_CLOUD);
        let args: Vec<(&str, &Path)> = match self {
            Self::FeatureExtractor => vec![
                ("--database_path", &paths.database),
                ("--image_path", &paths.images),
            ],
            Self::ExhaustiveMatcher => vec![("--database_path", &paths.database)],
            Self::Mapper => vec![
                ("--database_path", &paths.database),
                ("--image_path", &paths.images),
                ("--output_path", &paths.sparse),
            ],
            Self::ImageUndistorter => vec![
                ("--image_path", &paths.images),
                ("--input_path", &paths.sparse_model),
                ("--output_path", &paths.dense),
            ],
            Self::PatchMatchStereo => vec![("--workspace_path", &paths.dense)],
            Self::StereoFusion => vec![
                ("--workspace_path", &paths.dense),
                ("--output_path", &fused),
            ],
            Self::PoissonMesher => vec![("--input_path", &fused), ("--output_path", &paths.mesh)],
        };

        let mut argv: Vec<OsString> = vec![self.subcommand().into()];
        for (flag, value) in args {
            argv.push(flag.into());
            argv.push(value.as_os_str().to_owned());
        }
        StageInvocation { stage: self, args: argv }
    }
}

/// Filesystem locations the stages read from and write to.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePaths {
    pub images: PathBuf,
    pub database: PathBuf,
    pub sparse: PathBuf,
    /// First model written by the mapper.
    pub sparse_model: PathBuf,
    pub dense: PathBuf,
    pub mesh: PathBuf,
}

impl PipelinePaths {
    pub fn new(images: PathBuf, database: PathBuf, output: &Path) -> Self {
        let sparse = output.join("sparse");
        let dense = output.join("dense");
        Self {
            images,
            database,
            sparse_model: sparse.join("0"),
            mesh: dense.join(MESH_FILE_NAME),
            sparse,
            dense,
        }
    }
}

/// One stage's command line, without the executable.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInvocation {
    pub stage: PipelineStage,
    pub args: Vec<OsString>,
}

/// Executes a single pipeline stage to completion.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, invocation: &StageInvocation) -> Result<(), JobError>;
}

/// Runs stages through the `colmap` command-line tool.
pub struct ColmapRunner {
    executable: PathBuf,
    timeout: Option<Duration>,
}

impl ColmapRunner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StageRunner for ColmapRunner {
    async fn run(&self, invocation: &StageInvocation) -> Result<(), JobError> {
        let stage = invocation.stage;
        debug!(stage = %stage, args = ?invocation.args, "Running COLMAP stage");

        let mut child = Command::new(&self.executable)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => JobError::new(
                    FailureKind::ToolUnavailable,
                    format!("COLMAP executable not found: {}", self.executable.display()),
                ),
                _ => JobError::io(format!("Failed to start {}", stage.subcommand()), e),
            })?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, stage, None)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, stage, Some(Arc::clone(&tail)))));

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(stage = %stage, timeout_secs = limit.as_secs(), "Stage timed out, killing process");
                    let _ = child.kill().await;
                    return Err(JobError::new(
                        FailureKind::Timeout,
                        format!(
                            "{} ({}) timed out after {}s",
                            stage.label(),
                            stage.subcommand(),
                            limit.as_secs()
                        ),
                    ));
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| JobError::io(format!("Waiting for {}", stage.subcommand()), e))?;

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        if status.success() {
            return Ok(());
        }

        let last_line = tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned();
        let outcome = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "termination by signal".to_string(),
        };
        let mut message = format!("{} ({}) failed with {}", stage.label(), stage.subcommand(), outcome);
        if let Some(line) = last_line {
            message.push_str(": ");
            message.push_str(&line);
        }
        Err(JobError::new(FailureKind::StageFailed, message))
    }
}

/// How a line of stage output is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLevel {
    Warning,
    Progress,
    Detail,
}

const WARNING_MARKERS: [&str; 4] = ["ERROR", "WARNING", "error:", "Error:"];
const PROGRESS_MARKERS: [&str; 4] = ["Elapsed time:", "Writing output:", "Number of", "Processing"];

pub fn classify_output_line(line: &str) -> OutputLevel {
    if has_glog_severity(line) || WARNING_MARKERS.iter().any(|m| line.contains(m)) {
        OutputLevel::Warning
    } else if PROGRESS_MARKERS.iter().any(|m| line.contains(m)) {
        OutputLevel::Progress
    } else {
        OutputLevel::Detail
    }
}

/// glog prefix such as `E0504 12:30:00.123 ...` for errors, warnings and fatals.
fn has_glog_severity(line: &str) -> bool {
    let mut chars = line.trim_start().chars();
    matches!(
        (chars.next(), chars.next()),
        (Some('E' | 'W' | 'F'), Some(digit)) if digit.is_ascii_digit()
    )
}

/// Strip the glog header (`I0504 12:30:00.123 file.cc:42]`) from a progress line.
fn strip_log_prefix(line: &str) -> &str {
    match line.find(']') {
        Some(idx) if idx + 1 < line.len() => line[idx + 1..].trim(),
        _ => line.trim(),
    }
}

async fn forward_lines<R>(reader: R, stage: PipelineStage, tail: Option<Arc<Mutex<VecDeque<String>>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match classify_output_line(&line) {
            OutputLevel::Warning => warn!(stage = %stage, "{}", line),
            OutputLevel::Progress => info!(stage = %stage, "{}", strip_log_prefix(&line)),
            OutputLevel::Detail => debug!(stage = %stage, "{}", line),
        }
        if let Some(tail) = &tail {
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}
