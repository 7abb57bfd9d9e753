use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use photogrammetry_pipeline::{
    config::DashboardConfig,
    services::{
        dashboard::DashboardReconciler, progress::ProgressChannel, render::render_dashboard,
        topology::Topology,
    },
    shutdown,
};

const READ_BLOCK_MS: u64 = 1_000;
const READ_BATCH: usize = 100;
const READ_RETRY: Duration = Duration::from_secs(2);
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[tokio::main]
async fn main() {
    // Logs go to stderr so the table on stdout stays readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DashboardConfig::from_env().expect("Failed to load configuration");
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let channel = ProgressChannel::new(redis, Topology::default());
    let reconciler = Arc::new(DashboardReconciler::new(config.recent_projects));
    let shutdown = shutdown::on_ctrl_c();

    let reader = tokio::spawn(follow_progress(channel, reconciler.clone(), shutdown.clone()));

    let mut ticker = tokio::time::interval(Duration::from_millis(config.refresh_interval_ms.max(100)));
    let mut stop = shutdown.clone();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let screen = render_dashboard(&reconciler.render_snapshot(Utc::now()));
                let mut stdout = std::io::stdout().lock();
                let _ = write!(stdout, "{}{}", CLEAR_SCREEN, screen);
                let _ = stdout.flush();
            }
            _ = stop.wait_for(|stop| *stop) => break,
        }
    }

    let _ = reader.await;
    println!("Dashboard stopped");
}

/// Feed new verbose events into the reconciler until shutdown.
async fn follow_progress(
    channel: ProgressChannel,
    reconciler: Arc<DashboardReconciler>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Only events published after start-up
    let mut cursor = "$".to_string();

    while !*shutdown.borrow() {
        match channel.read_after(&cursor, READ_BLOCK_MS, READ_BATCH).await {
            Ok(batch) => {
                for event in &batch.events {
                    reconciler.apply_update(event);
                }
                if let Some(last_id) = batch.last_id {
                    cursor = last_id;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read verbose status stream");
                tokio::select! {
                    _ = tokio::time::sleep(READ_RETRY) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
