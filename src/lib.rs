//! Photogrammetry reconstruction pipeline
//!
//! Projects are uploaded as photo archives through the HTTP API, queued on a
//! Redis Streams work queue and reconstructed by COLMAP workers. Workers report
//! authoritative transitions on the status queue, applied to PostgreSQL by the
//! API's status consumer, and fine-grained progress on the verbose stream read
//! by the terminal dashboard.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
