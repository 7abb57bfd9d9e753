use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the HTTP API process (also hosts the status consumer).
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the work queue and status streams
    pub redis_url: String,

    /// Shared directory holding `project_{id}` working directories
    #[serde(default = "default_jobs_root")]
    pub jobs_root: PathBuf,

    /// Public base URL used to build download links
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upper bound for an uploaded photo archive
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Configuration for a reconstruction worker process.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Redis connection string for the work queue and status streams
    pub redis_url: String,

    /// Shared directory holding `project_{id}` working directories
    #[serde(default = "default_jobs_root")]
    pub jobs_root: PathBuf,

    /// COLMAP executable
    #[serde(default = "default_colmap_path")]
    pub colmap_path: PathBuf,

    /// Stable worker name. Generated when unset.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Local scratch directory for per-job caches (removed after every attempt)
    pub scratch_root: Option<PathBuf>,

    /// Deliveries after which a retriable failure is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// How long a single XREADGROUP blocks waiting for work
    #[serde(default = "default_consume_block_ms")]
    pub consume_block_ms: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Entries pending longer than this are reclaimed from crashed workers (24h)
    #[serde(default = "default_consumer_timeout_secs")]
    pub consumer_timeout_secs: u64,

    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,

    /// Kill a pipeline stage running longer than this
    pub stage_timeout_secs: Option<u64>,

    /// Optional Prometheus scrape listener (e.g., "0.0.0.0:9100")
    pub metrics_addr: Option<SocketAddr>,
}

/// Configuration for the terminal status dashboard.
#[derive(Debug, Deserialize)]
pub struct DashboardConfig {
    /// Redis connection string for the verbose status stream
    pub redis_url: String,

    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Number of most recent projects shown
    #[serde(default = "default_recent_projects")]
    pub recent_projects: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_jobs_root() -> PathBuf {
    PathBuf::from("Projects")
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_max_upload_bytes() -> usize {
    2 * 1024 * 1024 * 1024
}

fn default_colmap_path() -> PathBuf {
    PathBuf::from("colmap")
}

fn default_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_consume_block_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_consumer_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_reclaim_interval_secs() -> u64 {
    60
}

fn default_refresh_interval_ms() -> u64 {
    1_000
}

fn default_recent_projects() -> usize {
    15
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
