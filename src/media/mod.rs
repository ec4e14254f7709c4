//! Decoded video frames: where they come from and which ones get analysed.

use crate::db::models::camera_models::Transport;
use crate::error::Error;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod gst_source;
pub mod imaging;

pub use gst_source::GstSourceOpener;

/// One decoded RGB frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Position in the decoded stream, starting at 0
    pub index: u64,
    /// Presentation timestamp when the source provides one
    pub pts: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceInfo {
    pub fps: Option<f64>,
    pub width: u32,
    pub height: u32,
    /// Known for files only
    pub duration: Option<Duration>,
}

impl SourceInfo {
    /// Frame count estimated from duration and rate
    pub fn estimated_frames(&self) -> Option<u64> {
        match (self.duration, self.fps) {
            (Some(d), Some(fps)) if fps > 0.0 => Some((d.as_secs_f64() * fps).round() as u64),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum FramePoll {
    Frame(Frame),
    /// Nothing arrived within the poll timeout
    Pending,
    /// End of stream
    Ended,
}

/// What to decode
#[derive(Debug, Clone, PartialEq)]
pub enum SourceTarget {
    Rtsp {
        url: String,
        transport: Transport,
        timeout_ms: u64,
    },
    File(PathBuf),
}

impl SourceTarget {
    pub fn is_live(&self) -> bool {
        matches!(self, SourceTarget::Rtsp { .. })
    }
}

/// Stops a source from another thread, unblocking a pending `next_frame`.
pub type AbortHandle = Arc<dyn Fn() + Send + Sync>;

/// A running decoder. All methods may block.
pub trait FrameSource: Send {
    fn info(&self) -> SourceInfo;

    /// `Err(Error::Decode)` means one bad frame, anything else is fatal.
    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll, Error>;

    fn abort_handle(&self) -> AbortHandle;
}

/// Opens decoders. `open` blocks until the first frame is available or the
/// target's timeout expires (`Error::Connection`).
pub trait SourceOpener: Send + Sync {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn FrameSource>, Error>;
}

/// Frame-skip policy bounding how many frames reach recognition.
///
/// With a known source rate every Nth frame passes, `N = round(source /
/// target)`. Without one, frames pass when at least `1 / target` seconds
/// have elapsed since the last accepted frame.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    stride: Option<u64>,
    interval: Duration,
    last_accepted: Option<Duration>,
    started: Instant,
}

impl FrameThrottle {
    pub fn new(source_fps: Option<f64>, target_fps: f64) -> Self {
        let (stride, interval) = if target_fps <= 0.0 {
            (Some(1), Duration::ZERO)
        } else {
            let stride = source_fps
                .filter(|fps| *fps > 0.0)
                .map(|fps| ((fps / target_fps).round() as u64).max(1));
            (stride, Duration::from_secs_f64(1.0 / target_fps))
        };

        Self {
            stride,
            interval,
            last_accepted: None,
            started: Instant::now(),
        }
    }

    /// Accept every `stride`th frame
    pub fn every(stride: u64) -> Self {
        Self {
            stride: Some(stride.max(1)),
            interval: Duration::ZERO,
            last_accepted: None,
            started: Instant::now(),
        }
    }

    pub fn stride(&self) -> Option<u64> {
        self.stride
    }

    pub fn accept(&mut self, index: u64, pts: Option<Duration>) -> bool {
        if let Some(stride) = self.stride {
            return index % stride == 0;
        }

        let at = pts.unwrap_or_else(|| self.started.elapsed());
        match self.last_accepted {
            Some(last) if at.saturating_sub(last) < self.interval && at >= last => false,
            _ => {
                self.last_accepted = Some(at);
                true
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_from_known_rate() {
        let mut throttle = FrameThrottle::new(Some(30.0), 3.0);
        assert_eq!(throttle.stride(), Some(10));
        let accepted: Vec<u64> = (0..35).filter(|i| throttle.accept(*i, None)).collect();
        assert_eq!(accepted, vec![0, 10, 20, 30]);
    }

    #[test]
    fn target_above_source_passes_everything() {
        let mut throttle = FrameThrottle::new(Some(10.0), 15.0);
        assert_eq!(throttle.stride(), Some(1));
        assert!((0..5).all(|i| throttle.accept(i, None)));
    }

    #[test]
    fn time_based_without_rate() {
        let mut throttle = FrameThrottle::new(None, 2.0);
        let ms = |v| Some(Duration::from_millis(v));
        assert!(throttle.accept(0, ms(0)));
        assert!(!throttle.accept(1, ms(100)));
        assert!(!throttle.accept(2, ms(499)));
        assert!(throttle.accept(3, ms(500)));
        assert!(throttle.accept(4, ms(1200)));
    }

    #[test]
    fn estimated_frames() {
        let info = SourceInfo {
            fps: Some(25.0),
            width: 640,
            height: 480,
            duration: Some(Duration::from_secs(4)),
        };
        assert_eq!(info.estimated_frames(), Some(100));
        assert_eq!(SourceInfo::default().estimated_frames(), None);
    }
}
