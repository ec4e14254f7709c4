pub mod cameras;
pub mod events;
pub mod jobs;
pub mod settings;
pub mod watchlist;
