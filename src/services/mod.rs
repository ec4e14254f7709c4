pub mod camera_registry;
pub mod compare;
pub mod settings;
pub mod watchlist;

pub use camera_registry::CameraRegistry;
pub use settings::RuntimeSettings;
pub use watchlist::WatchlistService;
