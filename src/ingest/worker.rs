use super::IngestContext;
use crate::db::models::camera_models::{CameraConfig, CameraStatus};
use crate::db::now_millis;
use crate::error::Error;
use crate::media::imaging;
use crate::media::{Frame, FramePoll, FrameSource, FrameThrottle};
use crate::messaging::MatchPayload;
use crate::recognition::{DetectionEngine, FaceCandidate, MatchSet, Verdict};
use crate::store::FaceObservation;
use bytes::Bytes;
use image::RgbImage;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Decoded frames waiting for analysis. Small, so a slow model drops
/// frames instead of falling behind the live stream.
pub(crate) const FRAME_QUEUE: usize = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub(crate) enum DecodeMsg {
    Frame(Frame),
    /// The decoder gave up; the camera goes to error
    Fatal(Error),
}

/// What faces of this camera are matched against
#[derive(Clone)]
pub(crate) enum MatchSource {
    Single(Arc<Vec<f32>>),
    /// Resolved per frame so enrolment changes apply immediately
    Watchlist,
}

pub(crate) struct DecodeLimits {
    pub max_decode_errors: u32,
    pub stall_timeout: Duration,
}

/// Run the blocking decode loop on its own thread. Accepted frames are
/// offered to `tx` without waiting; the loop ends on cancellation, on a
/// fatal source condition, or when the receiver is gone.
pub(crate) fn spawn_decoder(
    camera_id: String,
    mut source: Box<dyn FrameSource>,
    mut throttle: FrameThrottle,
    limits: DecodeLimits,
    tx: mpsc::Sender<DecodeMsg>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("decode-{}", camera_id))
        .spawn(move || {
            let poll = POLL_INTERVAL.min(limits.stall_timeout);
            let mut consecutive_errors = 0u32;
            let mut last_frame = Instant::now();
            let mut dropped = 0u64;

            let fatal = |error: Error| {
                if !cancel.is_cancelled() {
                    let _ = tx.blocking_send(DecodeMsg::Fatal(error));
                }
            };

            while !cancel.is_cancelled() {
                match source.next_frame(poll) {
                    Ok(FramePoll::Frame(frame)) => {
                        consecutive_errors = 0;
                        last_frame = Instant::now();
                        if !throttle.accept(frame.index, frame.pts) {
                            continue;
                        }
                        match tx.try_send(DecodeMsg::Frame(frame)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped += 1;
                                trace!("Camera {} analysis busy, dropped frame", camera_id);
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Ok(FramePoll::Pending) => {
                        if last_frame.elapsed() >= limits.stall_timeout {
                            fatal(Error::Connection(format!(
                                "No frame received for {} ms",
                                limits.stall_timeout.as_millis()
                            )));
                            break;
                        }
                    }
                    Ok(FramePoll::Ended) => {
                        fatal(Error::Connection("Stream ended".to_string()));
                        break;
                    }
                    Err(Error::Decode(msg)) => {
                        consecutive_errors += 1;
                        debug!(
                            "Camera {} decode error {}/{}: {}",
                            camera_id, consecutive_errors, limits.max_decode_errors, msg
                        );
                        if consecutive_errors >= limits.max_decode_errors {
                            fatal(Error::Decode(format!(
                                "{} consecutive frames failed to decode, last: {}",
                                consecutive_errors, msg
                            )));
                            break;
                        }
                    }
                    Err(e) => {
                        fatal(e);
                        break;
                    }
                }
            }

            if dropped > 0 {
                debug!("Camera {} dropped {} frames while busy", camera_id, dropped);
            }
            debug!("Decode loop of camera {} finished", camera_id);
        })
}

/// Analysis loop of one camera. Frames are handled one at a time, so
/// events are recorded and published in capture order.
pub(crate) async fn run_worker(
    ctx: IngestContext,
    camera: CameraConfig,
    matcher: MatchSource,
    mut rx: mpsc::Receiver<DecodeMsg>,
    cancel: CancellationToken,
) {
    let id = camera.id.clone();
    let mut cooldown = EventCooldown::new(ctx.config.event_cooldown_ms);
    info!("Camera {} worker started", id);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => msg,
        };

        match msg {
            Some(DecodeMsg::Frame(frame)) => {
                process_frame(&ctx, &camera, &matcher, &mut cooldown, frame).await;
            }
            Some(DecodeMsg::Fatal(e)) => {
                if !cancel.is_cancelled() {
                    fail(&ctx, &id, e).await;
                }
                break;
            }
            None => break,
        }
    }

    info!("Camera {} worker stopped", id);
}

async fn fail(ctx: &IngestContext, id: &str, e: Error) {
    if let Err(te) = ctx
        .registry
        .transition(id, CameraStatus::Error, Some(e.to_string()))
        .await
    {
        debug!("Camera {} error not recorded: {}", id, te);
    }
    ctx.snapshots.clear(id);
    ctx.broadcaster.close(id).await;
}

/// Limits stored events of one camera to one per window
struct EventCooldown {
    window_ms: i64,
    last_recorded: Option<i64>,
}

impl EventCooldown {
    fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms as i64,
            last_recorded: None,
        }
    }

    fn ready(&self, ts: i64) -> bool {
        self.last_recorded
            .map_or(true, |last| ts - last >= self.window_ms)
    }

    fn recorded(&mut self, ts: i64) {
        self.last_recorded = Some(ts);
    }
}

struct Analysis {
    faces: Result<Vec<(FaceCandidate, Verdict)>, Error>,
    snapshot: Option<Vec<u8>>,
    elapsed_ms: f64,
}

async fn process_frame(
    ctx: &IngestContext,
    camera: &CameraConfig,
    matcher: &MatchSource,
    cooldown: &mut EventCooldown,
    frame: Frame,
) {
    let ts = now_millis();
    let frame_number = frame.index as i64;
    let image = Arc::new(frame.image);
    let set = match matcher {
        MatchSource::Single(known) => MatchSet::Single(Arc::clone(known)),
        MatchSource::Watchlist => MatchSet::Watchlist(ctx.gallery.snapshot()),
    };

    let engine = ctx.engine.clone();
    let threshold = camera.threshold;
    let shared = Arc::clone(&image);
    let analysis = tokio::task::spawn_blocking(move || analyse(&engine, &shared, &set, threshold)).await;
    let analysis = match analysis {
        Ok(analysis) => analysis,
        Err(e) => {
            error!("Analysis of camera {} panicked: {}", camera.id, e);
            return;
        }
    };

    ctx.registry.record_frame(&camera.id);
    if let Some(jpeg) = analysis.snapshot {
        ctx.snapshots.put(&camera.id, Bytes::from(jpeg), ts);
    }

    let faces = match analysis.faces {
        Ok(faces) => faces,
        Err(e) => {
            warn!("Camera {} frame {} not analysed: {}", camera.id, frame_number, e);
            return;
        }
    };

    let mut best: Option<f32> = None;
    let mut published = 0u64;
    for (candidate, verdict) in faces {
        best = Some(best.map_or(verdict.similarity, |b| b.max(verdict.similarity)));
        let observation = FaceObservation {
            camera_id: camera.id.clone(),
            ts,
            frame_number: Some(frame_number),
            candidate,
            verdict,
            processing_time_ms: analysis.elapsed_ms,
        };

        if !cooldown.ready(ts) {
            let payload =
                MatchPayload::from_observation(&observation, threshold, ctx.store.quality_threshold());
            ctx.broadcaster.publish(&camera.id, payload).await;
            published += 1;
            continue;
        }

        match ctx.store.record(Arc::clone(&image), observation).await {
            Ok(event) => {
                cooldown.recorded(ts);
                if event.matched {
                    info!(
                        "Camera {} matched {} ({:.2})",
                        camera.id,
                        event.person_name.as_deref().unwrap_or("?"),
                        event.confidence
                    );
                }
                let payload = MatchPayload::from_event(&event, threshold);
                ctx.broadcaster.publish(&camera.id, payload).await;
                published += 1;
            }
            Err(e) => error!("Failed to record event of camera {}: {}", camera.id, e),
        }
    }

    ctx.registry.record_detections(&camera.id, best, published);
}

/// Detection, matching and the annotated snapshot of one frame
fn analyse(
    engine: &DetectionEngine,
    image: &RgbImage,
    set: &MatchSet,
    threshold: f32,
) -> Analysis {
    let started = Instant::now();
    let faces = engine.detect(image).map(|candidates| {
        candidates
            .into_iter()
            .map(|candidate| {
                let verdict = engine.recognize(&candidate, set, threshold);
                (candidate, verdict)
            })
            .collect::<Vec<_>>()
    });
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut annotated = image.clone();
    if let Ok(faces) = &faces {
        for (candidate, verdict) in faces {
            imaging::draw_box(&mut annotated, &candidate.bbox, verdict.matched);
        }
    }
    let snapshot = match imaging::encode_jpeg(&annotated, imaging::SNAPSHOT_QUALITY) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            warn!("Failed to encode snapshot: {}", e);
            None
        }
    };

    Analysis {
        faces,
        snapshot,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_allows_one_event_per_window() {
        let mut cooldown = EventCooldown::new(1000);
        assert!(cooldown.ready(5_000));
        cooldown.recorded(5_000);
        assert!(!cooldown.ready(5_000));
        assert!(!cooldown.ready(5_999));
        assert!(cooldown.ready(6_000));

        let mut always = EventCooldown::new(0);
        always.recorded(5_000);
        assert!(always.ready(5_000));
    }
}
