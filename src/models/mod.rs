pub mod project;
pub mod status;
