//! Live RTSP ingestion: one supervised worker per running camera.

use crate::config::IngestConfig;
use crate::messaging::EventBroadcaster;
use crate::media::SourceOpener;
use crate::recognition::{DetectionEngine, WatchlistGallery};
use crate::services::camera_registry::CameraRegistry;
use crate::store::{EventStore, SnapshotCache};
use std::sync::Arc;

pub mod supervisor;
mod worker;

pub use supervisor::IngestSupervisor;

/// Everything a camera worker reads from or writes to
#[derive(Clone)]
pub struct IngestContext {
    pub registry: Arc<CameraRegistry>,
    pub engine: DetectionEngine,
    pub gallery: Arc<WatchlistGallery>,
    pub store: EventStore,
    pub snapshots: Arc<SnapshotCache>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub opener: Arc<dyn SourceOpener>,
    pub config: IngestConfig,
}
