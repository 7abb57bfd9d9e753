pub mod dashboard;
pub mod failure;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod render;
pub mod status;
pub mod status_consumer;
pub mod topology;
pub mod upload;
pub mod worker;
pub mod workspace;
