pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod media;
pub mod messaging;
pub mod recognition;
pub mod services;
pub mod store;

// Re-export main components for easier use
pub use error::Error;
pub use ingest::IngestSupervisor;
pub use jobs::JobManager;
pub use recognition::DetectionEngine;
