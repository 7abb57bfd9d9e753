use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use photogrammetry_pipeline::{
    app_state::AppState,
    config::ApiConfig,
    db::{self, queries::PgProjectStore},
    routes::{self, metrics::MetricsState},
    services::{
        progress::ProgressChannel, queue::JobQueue, status::StatusChannel,
        status_consumer::StatusConsumer, topology::Topology, upload::UploadStore,
    },
    shutdown,
};

/// Consumer name of the API's status consumer. Stable across restarts so
/// entries left pending by a previous run are picked up again.
const STATUS_CONSUMER_NAME: &str = "api-status-consumer";

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = ApiConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing photogrammetry API");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("projects_created_total", "Projects created and queued");
    metrics::describe_counter!(
        "status_updates_applied_total",
        "Authoritative status updates that changed a project"
    );
    metrics::describe_counter!(
        "status_updates_ignored_total",
        "Duplicate, disallowed or stale status updates"
    );
    metrics::describe_gauge!("work_queue_depth", "Entries in the work queue");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Declaring broker topology");
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let topology = Topology::default();
    topology
        .declare(&redis)
        .await
        .expect("Failed to declare broker topology");

    tokio::fs::create_dir_all(&config.jobs_root)
        .await
        .expect("Failed to create jobs root");

    let queue = JobQueue::with_client(redis.clone(), topology.clone());
    let progress = ProgressChannel::new(redis.clone(), topology.clone());
    let state = AppState::new(
        db_pool.clone(),
        queue.clone(),
        Arc::new(progress),
        UploadStore::new(&config.jobs_root),
        &config.base_url,
    );
    let metrics_state = MetricsState {
        handle: prometheus_handle,
        queue: state.queue.clone(),
    };

    let shutdown = shutdown::on_ctrl_c();

    // The status consumer is the sole writer of project status
    let consumer = StatusConsumer::new(Arc::new(PgProjectStore::new(db_pool)));
    let status_channel = StatusChannel::new(redis, topology);
    let consumer_shutdown = shutdown.clone();
    let consumer_task = tokio::spawn(async move {
        consumer
            .run(status_channel, STATUS_CONSUMER_NAME.to_string(), consumer_shutdown)
            .await;
    });

    let app = routes::router(state, metrics_state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::wait_for(shutdown))
        .await
        .expect("Server error");

    if let Err(e) = consumer_task.await {
        tracing::error!(error = %e, "Status consumer task failed");
    }
    tracing::info!("Photogrammetry API stopped");
}
