pub mod camera_models;
pub mod event_models;
pub mod job_models;
pub mod watchlist_models;
