use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// Latest JPEG frame of a camera
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Increases with every frame written for the camera
    pub seq: u64,
    pub jpeg: Bytes,
    pub captured_at: i64,
}

/// Most recent frame per camera. Each camera's worker is the only writer;
/// status, snapshot and MJPEG handlers read.
#[derive(Default)]
pub struct SnapshotCache {
    frames: RwLock<HashMap<String, Snapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, camera_id: &str, jpeg: Bytes, captured_at: i64) {
        let mut frames = match self.frames.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let seq = frames.get(camera_id).map_or(1, |s| s.seq + 1);
        frames.insert(
            camera_id.to_string(),
            Snapshot {
                seq,
                jpeg,
                captured_at,
            },
        );
    }

    pub fn get(&self, camera_id: &str) -> Option<Snapshot> {
        let frames = match self.frames.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        frames.get(camera_id).cloned()
    }

    pub fn clear(&self, camera_id: &str) {
        let mut frames = match self.frames.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        frames.remove(camera_id);
    }
}
