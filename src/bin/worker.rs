use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use photogrammetry_pipeline::{
    config::WorkerConfig,
    services::{
        pipeline::ColmapRunner,
        progress::ProgressChannel,
        queue::JobQueue,
        status::StatusChannel,
        topology::Topology,
        worker::{EngineSettings, JobProcessor, ProcessorSettings, WorkerEngine},
    },
    shutdown,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = WorkerConfig::from_env().expect("Failed to load configuration");

    tracing::info!(
        worker_id = %config.worker_id,
        colmap = %config.colmap_path.display(),
        jobs_root = %config.jobs_root.display(),
        "Starting reconstruction worker"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to start Prometheus listener");
        metrics::describe_counter!(
            "reconstruction_jobs_total",
            "Reconstruction jobs settled, by outcome"
        );
        metrics::describe_histogram!(
            "reconstruction_stage_seconds",
            "Duration of one COLMAP pipeline stage"
        );
        metrics::describe_histogram!(
            "reconstruction_job_seconds",
            "Duration of one reconstruction attempt"
        );
        metrics::describe_gauge!("work_queue_depth", "Entries in the work queue");
        tracing::info!("Metrics listening on {}", addr);
    }

    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let topology = Topology::default().with_consumer_timeout(config.consumer_timeout());
    topology
        .declare(&redis)
        .await
        .expect("Failed to declare broker topology");

    let queue = JobQueue::with_client(redis.clone(), topology.clone());
    let status = Arc::new(StatusChannel::new(redis.clone(), topology.clone()));
    let progress = Arc::new(ProgressChannel::new(redis, topology));
    let runner = Arc::new(ColmapRunner::new(&config.colmap_path).with_timeout(config.stage_timeout()));

    let processor = JobProcessor::new(
        ProcessorSettings {
            worker_id: config.worker_id.clone(),
            jobs_root: config.jobs_root.clone(),
            scratch_root: config.scratch_root.clone(),
            max_deliveries: config.max_deliveries,
            progress_interval: config.heartbeat_interval(),
        },
        runner,
        status,
        progress.clone(),
    );
    let engine = WorkerEngine::new(
        queue,
        processor,
        progress,
        EngineSettings {
            consume_block_ms: config.consume_block_ms,
            heartbeat_interval: config.heartbeat_interval(),
            consumer_timeout: config.consumer_timeout(),
            reclaim_interval: config.reclaim_interval(),
        },
    );

    engine.run(shutdown::on_ctrl_c()).await;
}
