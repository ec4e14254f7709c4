use super::JobRequest;
use crate::error::Error;
use crate::media::imaging;
use crate::media::{Frame, FramePoll, FrameSource, FrameThrottle, SourceInfo, SourceOpener, SourceTarget};
use crate::recognition::{
    cosine_similarity, BBox, DetectionEngine, FaceCandidate, MatchSet, WatchlistGallery,
};
use image::RgbImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cell::Cell;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Subdirectory of the data dir holding per-job outputs
pub const JOBS_DIR: &str = "jobs";

/// Rate at which pic-to-video and video-to-video sample their videos
const PIC_TO_VIDEO_FPS: f64 = 3.0;
/// Distinct faces of video A paired against video B
const MAX_PAIRED_FACES: usize = 1800;
/// Faces more similar than this count as the same unique face
const UNIQUE_FACE_SIMILARITY: f32 = 0.8;
/// Give up on a file that produces nothing for this long
const FILE_STALL: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(500);
const PROGRESS_STEP: f64 = 0.01;

/// Progress and cancellation seen from inside a running job
pub struct JobProgress {
    report: Box<dyn Fn(f64) + Send>,
    cancel: CancellationToken,
    last: Cell<f64>,
    /// Start and span of the current phase
    phase: Cell<(f64, f64)>,
}

impl JobProgress {
    pub fn new(report: Box<dyn Fn(f64) + Send>, cancel: CancellationToken) -> Self {
        Self {
            report,
            cancel,
            last: Cell::new(0.0),
            phase: Cell::new((0.0, 1.0)),
        }
    }

    /// Progress that goes nowhere
    pub fn detached() -> Self {
        Self::new(Box::new(|_| {}), CancellationToken::new())
    }

    /// Report a fraction; values never go back and stay below 1 until the
    /// job completes.
    pub fn set(&self, fraction: f64) {
        let (start, span) = self.phase.get();
        let fraction = (start + fraction.clamp(0.0, 1.0) * span).min(0.99);
        if fraction - self.last.get() >= PROGRESS_STEP {
            self.last.set(fraction);
            (self.report)(fraction);
        }
    }

    /// Map later fractions onto `[start, start + span]`
    pub fn phase(&self, start: f64, span: f64) {
        self.phase.set((start, span));
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Job("Job cancelled by shutdown".to_string()))
        } else {
            Ok(())
        }
    }
}

/// A pic-to-video hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMatch {
    /// Seconds into the video
    pub time: f64,
    pub frame: u64,
    pub bbox: BBox,
    pub confidence: f32,
    pub thumb_relpath: String,
}

/// One side of a video-to-video pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSide {
    /// Seconds into the video
    pub time: f64,
    pub frame: u64,
    pub bbox: BBox,
    pub thumb_relpath: String,
}

/// A face of video A and its best sighting in video B
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacePair {
    pub confidence: f32,
    #[serde(rename = "A")]
    pub a: PairSide,
    #[serde(rename = "B")]
    pub b: PairSide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BBox,
    pub confidence: f32,
    pub similarity: f32,
    pub matched: bool,
    pub thumb_path: String,
    pub frame_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub frame: u64,
    pub timestamp: f64,
    pub faces: Vec<FaceDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub frames_with_faces: u64,
    pub frames_without_faces: u64,
    pub avg_faces_per_frame: f64,
    pub max_faces_in_frame: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub video_info: VideoInfo,
    pub statistics: FrameStatistics,
}

/// Result of video and RTSP analysis jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub total_frames: u64,
    pub processed_frames: u64,
    pub total_faces: u64,
    pub matched_faces: u64,
    pub unique_faces: u64,
    /// Seconds
    pub processing_time: f64,
    /// Frames with at least one face
    pub detections: Vec<FrameDetections>,
    pub summary: AnalysisSummary,
}

impl AnalysisResult {
    /// One row per frame with faces
    pub fn to_csv(&self) -> String {
        let mut out = String::from("Frame,Timestamp,Faces_Count,Matched_Count,Person_Names\n");
        for detection in &self.detections {
            let matched: Vec<&FaceDetection> = detection.faces.iter().filter(|f| f.matched).collect();
            let names: Vec<&str> = matched
                .iter()
                .map(|f| f.person_name.as_deref().unwrap_or("Unknown"))
                .collect();
            let _ = writeln!(
                out,
                "{},{},{},{},{}",
                detection.frame,
                detection.timestamp,
                detection.faces.len(),
                matched.len(),
                csv_field(&names.join("; "))
            );
        }
        out
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Running totals of an analysis job
#[derive(Default)]
struct Aggregate {
    processed_frames: u64,
    total_faces: u64,
    matched_faces: u64,
    unique: Vec<Vec<f32>>,
    frames_with_faces: u64,
    frames_without_faces: u64,
    max_faces_in_frame: u64,
    detections: Vec<FrameDetections>,
}

impl Aggregate {
    fn note_embedding(&mut self, embedding: &[f32]) {
        let seen = self
            .unique
            .iter()
            .any(|u| cosine_similarity(u, embedding) > UNIQUE_FACE_SIMILARITY);
        if !seen {
            self.unique.push(embedding.to_vec());
        }
    }

    fn finish(self, total_frames: u64, elapsed: Duration, video_info: VideoInfo) -> AnalysisResult {
        let avg = if self.processed_frames > 0 {
            self.total_faces as f64 / self.processed_frames as f64
        } else {
            0.0
        };
        AnalysisResult {
            total_frames,
            processed_frames: self.processed_frames,
            total_faces: self.total_faces,
            matched_faces: self.matched_faces,
            unique_faces: self.unique.len() as u64,
            processing_time: elapsed.as_secs_f64(),
            detections: self.detections,
            summary: AnalysisSummary {
                video_info,
                statistics: FrameStatistics {
                    frames_with_faces: self.frames_with_faces,
                    frames_without_faces: self.frames_without_faces,
                    avg_faces_per_frame: avg,
                    max_faces_in_frame: self.max_faces_in_frame,
                },
            },
        }
    }
}

struct Sighting {
    time: f64,
    frame: u64,
    bbox: BBox,
    crop: RgbImage,
}

impl Sighting {
    fn of(frame: &Frame, time: f64, candidate: &FaceCandidate) -> Option<Self> {
        match imaging::thumbnail(&frame.image, &candidate.bbox) {
            Ok(crop) => Some(Self {
                time,
                frame: frame.index,
                bbox: candidate.bbox,
                crop,
            }),
            Err(e) => {
                debug!("No crop for face in frame {}: {}", frame.index, e);
                None
            }
        }
    }

    fn save(&self, data_dir: &Path, subdir: &str, prefix: &str) -> Result<PairSide, Error> {
        let thumb_relpath = imaging::save_jpeg(
            data_dir,
            subdir,
            &format!("{}_{}", prefix, self.frame),
            &self.crop,
            imaging::THUMB_QUALITY,
        )?;
        Ok(PairSide {
            time: round_to(self.time, 3),
            frame: self.frame,
            bbox: self.bbox,
            thumb_relpath,
        })
    }
}

/// A distinct face of video A
struct FaceTrack {
    embedding: Vec<f32>,
    first: Sighting,
    best: Option<(f32, Sighting)>,
}

/// When a decode loop stops
#[derive(Clone, Copy)]
enum Until {
    EndOfFile,
    Elapsed(Duration, u64),
}

/// Executes job requests. Everything here blocks; the manager runs it on
/// the blocking pool.
pub struct JobRunner {
    engine: DetectionEngine,
    gallery: Arc<WatchlistGallery>,
    opener: Arc<dyn SourceOpener>,
    data_dir: PathBuf,
}

impl JobRunner {
    pub fn new(
        engine: DetectionEngine,
        gallery: Arc<WatchlistGallery>,
        opener: Arc<dyn SourceOpener>,
        data_dir: &Path,
    ) -> Self {
        Self {
            engine,
            gallery,
            opener,
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Where a job writes its images, removed when the job fails
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.data_dir.join(JOBS_DIR).join(job_id)
    }

    pub fn run(&self, job_id: &str, request: &JobRequest, progress: &JobProgress) -> Result<Value, Error> {
        match request {
            JobRequest::PicToVideo {
                known_relpath,
                known_path,
                video_path,
                threshold,
            } => self.pic_to_video(job_id, known_relpath, known_path, video_path, *threshold, progress),
            JobRequest::VideoAnalysis {
                video_path,
                threshold,
                use_watchlist,
                skip_frames,
            } => {
                let target = SourceTarget::File(video_path.clone());
                let result = self.analyse(
                    job_id,
                    &target,
                    *threshold,
                    *use_watchlist,
                    *skip_frames,
                    Until::EndOfFile,
                    progress,
                )?;
                Ok(serde_json::to_value(result)?)
            }
            JobRequest::RtspAnalysis {
                url,
                transport,
                timeout_ms,
                duration_secs,
                threshold,
                use_watchlist,
                skip_frames,
                ..
            } => {
                let target = SourceTarget::Rtsp {
                    url: url.clone(),
                    transport: *transport,
                    timeout_ms: *timeout_ms,
                };
                let result = self.analyse(
                    job_id,
                    &target,
                    *threshold,
                    *use_watchlist,
                    *skip_frames,
                    Until::Elapsed(Duration::from_secs(*duration_secs), *timeout_ms),
                    progress,
                )?;
                Ok(serde_json::to_value(result)?)
            }
            JobRequest::VideoToVideo {
                video_a_path,
                video_b_path,
                threshold,
            } => self.video_to_video(job_id, video_a_path, video_b_path, *threshold, progress),
        }
    }

    fn pic_to_video(
        &self,
        job_id: &str,
        known_relpath: &str,
        known_path: &Path,
        video_path: &Path,
        threshold: f32,
        progress: &JobProgress,
    ) -> Result<Value, Error> {
        let known = imaging::load_image(known_path)?;
        let known_face = self
            .engine
            .best_face(&known)?
            .ok_or_else(|| Error::Job("No face found in known image".to_string()))?;
        let set = MatchSet::Single(Arc::new(known_face.embedding));

        let mut source = self.opener.open(&SourceTarget::File(video_path.to_path_buf()))?;
        let info = source.info();
        let throttle = FrameThrottle::new(info.fps, PIC_TO_VIDEO_FPS);
        let images_dir = job_subdir(job_id, imaging::IMAGES_DIR);
        let mut matches = Vec::new();

        decode_loop(source.as_mut(), throttle, Until::EndOfFile, info, progress, |frame| {
            let candidates = match self.engine.detect(&frame.image) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Job {} skipped frame {}: {}", job_id, frame.index, e);
                    return Ok(());
                }
            };
            let best = candidates
                .iter()
                .map(|c| (c, self.engine.recognize(c, &set, threshold)))
                .max_by(|a, b| {
                    a.1.similarity
                        .partial_cmp(&b.1.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });

            if let Some((candidate, verdict)) = best {
                if verdict.matched {
                    let prefix = format!("match_{}", frame.index);
                    let thumb_relpath = imaging::save_thumbnail_in(
                        &self.data_dir,
                        &images_dir,
                        &frame.image,
                        &candidate.bbox,
                        &prefix,
                    )?;
                    matches.push(VideoMatch {
                        time: round_to(frame_time(&frame, info.fps), 3),
                        frame: frame.index,
                        bbox: candidate.bbox,
                        confidence: round_to(verdict.similarity as f64, 4) as f32,
                        thumb_relpath,
                    });
                }
            }
            Ok(())
        })?;

        info!("Job {} found {} matches", job_id, matches.len());
        Ok(json!({
            "matches": matches,
            "known": { "relpath": known_relpath },
            "video": video_ref(video_path),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn analyse(
        &self,
        job_id: &str,
        target: &SourceTarget,
        threshold: f32,
        use_watchlist: bool,
        skip_frames: u64,
        until: Until,
        progress: &JobProgress,
    ) -> Result<AnalysisResult, Error> {
        let started = Instant::now();
        let gallery = self.gallery.snapshot();
        let set = (use_watchlist && !gallery.is_empty()).then(|| MatchSet::Watchlist(gallery));

        let mut source = self.opener.open(target)?;
        let info = source.info();
        let throttle = FrameThrottle::every(skip_frames.max(1));
        let images_dir = job_subdir(job_id, imaging::IMAGES_DIR);
        let frames_dir = job_subdir(job_id, imaging::FRAMES_DIR);
        let mut agg = Aggregate::default();

        let decoded = decode_loop(source.as_mut(), throttle, until, info, progress, |frame| {
            agg.processed_frames += 1;
            // frames are numbered from 1 in analysis results
            let number = frame.index + 1;
            let candidates = match self.engine.detect(&frame.image) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Job {} skipped frame {}: {}", job_id, number, e);
                    Vec::new()
                }
            };

            let count = candidates.len() as u64;
            agg.total_faces += count;
            agg.max_faces_in_frame = agg.max_faces_in_frame.max(count);
            if count == 0 {
                agg.frames_without_faces += 1;
                return Ok(());
            }
            agg.frames_with_faces += 1;

            let mut faces = Vec::with_capacity(candidates.len());
            for (n, candidate) in candidates.iter().enumerate() {
                agg.note_embedding(&candidate.embedding);
                let verdict = set
                    .as_ref()
                    .map(|set| self.engine.recognize(candidate, set, threshold));
                let matched = verdict.as_ref().map_or(false, |v| v.matched);
                if matched {
                    agg.matched_faces += 1;
                }

                let thumb_path = imaging::save_thumbnail_in(
                    &self.data_dir,
                    &images_dir,
                    &frame.image,
                    &candidate.bbox,
                    &format!("face_{}_{}", number, n),
                )?;
                let frame_path = if matched {
                    Some(imaging::save_full_frame_in(
                        &self.data_dir,
                        &frames_dir,
                        &frame.image,
                        &format!("frame_{}", number),
                    )?)
                } else {
                    None
                };

                let (similarity, person_id, person_name) = match verdict {
                    Some(v) if v.matched => (v.similarity, v.person_id, v.person_name),
                    Some(v) => (v.similarity, None, None),
                    None => (0.0, None, None),
                };
                faces.push(FaceDetection {
                    bbox: candidate.bbox,
                    confidence: candidate.det_score,
                    similarity,
                    matched,
                    thumb_path,
                    frame_path,
                    person_id,
                    person_name,
                });
            }

            agg.detections.push(FrameDetections {
                frame: number,
                timestamp: frame_time(&frame, info.fps).max(0.0),
                faces,
            });
            Ok(())
        })?;

        let elapsed = started.elapsed();
        let duration = match (target.is_live(), info.duration) {
            (true, _) => elapsed.as_secs_f64(),
            (false, Some(d)) => d.as_secs_f64(),
            (false, None) => 0.0,
        };
        let total_frames = if target.is_live() {
            decoded
        } else {
            info.estimated_frames().unwrap_or(decoded)
        };
        let video_info = VideoInfo {
            duration,
            fps: info.fps.unwrap_or(0.0),
            width: info.width,
            height: info.height,
        };

        let result = agg.finish(total_frames, elapsed, video_info);
        info!(
            "Job {} analysed {} frames: {} faces, {} matched, {} unique",
            job_id, result.processed_frames, result.total_faces, result.matched_faces, result.unique_faces
        );
        Ok(result)
    }
}

impl JobRunner {
    /// Cluster the faces of video A, then find the best sighting of each
    /// cluster in video B. Both videos are sampled at ≈3 fps.
    fn video_to_video(
        &self,
        job_id: &str,
        video_a: &Path,
        video_b: &Path,
        threshold: f32,
        progress: &JobProgress,
    ) -> Result<Value, Error> {
        let mut tracks: Vec<FaceTrack> = Vec::new();

        progress.phase(0.0, 0.5);
        self.sample_faces(job_id, video_a, progress, |frame, time, candidate| {
            let seen = tracks.iter().any(|t| {
                cosine_similarity(&t.embedding, &candidate.embedding) > UNIQUE_FACE_SIMILARITY
            });
            if seen || tracks.len() >= MAX_PAIRED_FACES {
                return;
            }
            if let Some(first) = Sighting::of(frame, time, candidate) {
                tracks.push(FaceTrack {
                    embedding: candidate.embedding.clone(),
                    first,
                    best: None,
                });
            }
        })?;
        debug!("Job {} found {} distinct faces in video A", job_id, tracks.len());

        progress.phase(0.5, 0.5);
        self.sample_faces(job_id, video_b, progress, |frame, time, candidate| {
            for track in tracks.iter_mut() {
                let similarity = cosine_similarity(&track.embedding, &candidate.embedding);
                let better = track.best.as_ref().map_or(true, |(best, _)| similarity > *best);
                if similarity >= threshold && better {
                    if let Some(sighting) = Sighting::of(frame, time, candidate) {
                        track.best = Some((similarity, sighting));
                    }
                }
            }
        })?;

        let images_dir = job_subdir(job_id, imaging::IMAGES_DIR);
        let mut pairs = Vec::new();
        for track in &tracks {
            if let Some((similarity, best)) = &track.best {
                pairs.push(FacePair {
                    confidence: round_to(*similarity as f64, 4) as f32,
                    a: track.first.save(&self.data_dir, &images_dir, "v2v_A")?,
                    b: best.save(&self.data_dir, &images_dir, "v2v_B")?,
                });
            }
        }

        info!(
            "Job {} paired {} of {} faces across videos",
            job_id,
            pairs.len(),
            tracks.len()
        );
        Ok(json!({
            "pairs": pairs,
            "faces_a": tracks.len(),
            "videoA": video_ref(video_a),
            "videoB": video_ref(video_b),
        }))
    }

    /// Every detected face of `video`, sampled at the pic-to-video rate
    fn sample_faces<F>(
        &self,
        job_id: &str,
        video: &Path,
        progress: &JobProgress,
        mut on_face: F,
    ) -> Result<u64, Error>
    where
        F: FnMut(&Frame, f64, &FaceCandidate),
    {
        let mut source = self.opener.open(&SourceTarget::File(video.to_path_buf()))?;
        let info = source.info();
        let throttle = FrameThrottle::new(info.fps, PIC_TO_VIDEO_FPS);

        decode_loop(source.as_mut(), throttle, Until::EndOfFile, info, progress, |frame| {
            match self.engine.detect(&frame.image) {
                Ok(candidates) => {
                    let time = frame_time(&frame, info.fps).max(0.0);
                    for candidate in &candidates {
                        on_face(&frame, time, candidate);
                    }
                }
                Err(e) => warn!("Job {} skipped frame {}: {}", job_id, frame.index, e),
            }
            Ok(())
        })
    }
}

fn job_subdir(job_id: &str, kind: &str) -> String {
    format!("{}/{}/{}", JOBS_DIR, job_id, kind)
}

fn video_ref(path: &Path) -> Value {
    json!({
        "name": path.file_name().map(|n| n.to_string_lossy().into_owned()),
        "path": path,
    })
}

/// Seconds of `frame` into its stream
fn frame_time(frame: &Frame, fps: Option<f64>) -> f64 {
    match (frame.pts, fps) {
        (Some(pts), _) => pts.as_secs_f64(),
        (None, Some(fps)) if fps > 0.0 => frame.index as f64 / fps,
        _ => 0.0,
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Feed accepted frames to `on_frame` until `until` is reached; returns how
/// many frames were decoded.
fn decode_loop<F>(
    source: &mut dyn FrameSource,
    mut throttle: FrameThrottle,
    until: Until,
    info: SourceInfo,
    progress: &JobProgress,
    mut on_frame: F,
) -> Result<u64, Error>
where
    F: FnMut(Frame) -> Result<(), Error>,
{
    let started = Instant::now();
    let total = info.estimated_frames().filter(|t| *t > 0);
    let stall_limit = match until {
        Until::EndOfFile => FILE_STALL,
        Until::Elapsed(_, timeout_ms) => Duration::from_millis(timeout_ms.max(1)),
    };
    let mut decoded = 0u64;
    let mut last_frame = Instant::now();

    loop {
        progress.check()?;
        if let Until::Elapsed(window, _) = until {
            let elapsed = started.elapsed();
            if elapsed >= window {
                break;
            }
            progress.set(elapsed.as_secs_f64() / window.as_secs_f64());
        }

        match source.next_frame(POLL) {
            Ok(FramePoll::Frame(frame)) => {
                decoded += 1;
                last_frame = Instant::now();
                if let (Until::EndOfFile, Some(total)) = (&until, total) {
                    progress.set(frame.index as f64 / total as f64);
                }
                if throttle.accept(frame.index, frame.pts) {
                    on_frame(frame)?;
                }
            }
            Ok(FramePoll::Pending) => {
                if last_frame.elapsed() >= stall_limit {
                    return Err(Error::Connection(format!(
                        "No frame received for {} ms",
                        stall_limit.as_millis()
                    )));
                }
            }
            Ok(FramePoll::Ended) => break,
            Err(Error::Decode(msg)) => debug!("Skipping undecodable frame: {}", msg),
            Err(e) => return Err(e),
        }
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{ScriptedOpener, Step};
    use crate::recognition::testing::{embedding_at, embedding_with_similarity, face, ScriptedAnalyzer};
    use crate::recognition::{Gallery, GalleryEntry};
    use image::RgbImage;
    use std::sync::Mutex;

    fn runner(dir: &Path, analyzer: ScriptedAnalyzer, opener: Arc<ScriptedOpener>) -> JobRunner {
        let gallery = WatchlistGallery::new(Gallery::new(vec![GalleryEntry {
            person_id: 7,
            person_name: "Alice".to_string(),
            embedding: embedding_at(0.0),
        }]));
        JobRunner::new(
            DetectionEngine::new(Arc::new(analyzer)),
            Arc::new(gallery),
            opener,
            dir,
        )
    }

    fn file_opener(frames: usize, fps: f64) -> Arc<ScriptedOpener> {
        let opener = ScriptedOpener::new(SourceInfo {
            fps: Some(fps),
            width: 320,
            height: 240,
            duration: Some(Duration::from_secs_f64(frames as f64 / fps)),
        });
        let mut steps: Vec<Step> = (0..frames).map(|_| Step::Frame(RgbImage::new(320, 240))).collect();
        steps.push(Step::End);
        opener.push(steps);
        Arc::new(opener)
    }

    fn known_image(dir: &Path) -> PathBuf {
        let path = dir.join("known.jpg");
        RgbImage::new(160, 160).save(&path).unwrap();
        path
    }

    /// Sees Alice in small images and a stranger in everything else
    struct StrangerInVideo;

    impl crate::recognition::FaceAnalyzer for StrangerInVideo {
        fn analyze(&self, image: &RgbImage) -> Result<Vec<crate::recognition::DetectedFace>, Error> {
            let embedding = if image.width() < 200 {
                embedding_at(0.0)
            } else {
                embedding_at(1.5)
            };
            Ok(vec![face(BBox::new(10, 10, 90, 110), embedding)])
        }
    }

    #[test]
    fn pic_to_video_without_the_face_is_done_with_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Arc::new(WatchlistGallery::default());
        let runner = JobRunner::new(
            DetectionEngine::new(Arc::new(StrangerInVideo)),
            gallery,
            file_opener(30, 30.0),
            dir.path(),
        );

        let request = JobRequest::PicToVideo {
            known_relpath: "uploads/known.jpg".to_string(),
            known_path: known_image(dir.path()),
            video_path: dir.path().join("clip.mp4"),
            threshold: 0.6,
        };
        let result = runner.run("job-1", &request, &JobProgress::detached()).unwrap();

        assert_eq!(result["matches"], json!([]));
        assert_eq!(result["known"]["relpath"], "uploads/known.jpg");
    }

    #[test]
    fn pic_to_video_samples_three_frames_per_second() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = ScriptedAnalyzer::new(vec![face(BBox::new(10, 10, 90, 110), embedding_at(0.0))]);
        let runner = runner(dir.path(), analyzer, file_opener(30, 30.0));

        let request = JobRequest::PicToVideo {
            known_relpath: "uploads/known.jpg".to_string(),
            known_path: known_image(dir.path()),
            video_path: dir.path().join("clip.mp4"),
            threshold: 0.6,
        };
        let result = runner.run("job-2", &request, &JobProgress::detached()).unwrap();
        let matches: Vec<VideoMatch> = serde_json::from_value(result["matches"].clone()).unwrap();

        let frames: Vec<u64> = matches.iter().map(|m| m.frame).collect();
        assert_eq!(frames, vec![0, 10, 20]);
        assert!((matches[1].time - 0.333).abs() < 1e-9);
        assert!(dir.path().join(&matches[0].thumb_relpath).exists());
    }

    /// Alice and Bob in the 320 px video A, Alice alone in the 640 px video B
    struct TwoVideos;

    impl crate::recognition::FaceAnalyzer for TwoVideos {
        fn analyze(&self, image: &RgbImage) -> Result<Vec<crate::recognition::DetectedFace>, Error> {
            Ok(if image.width() < 400 {
                vec![
                    face(BBox::new(10, 10, 90, 110), embedding_at(0.0)),
                    face(BBox::new(150, 20, 230, 120), embedding_at(1.5)),
                ]
            } else {
                vec![face(BBox::new(300, 100, 400, 220), embedding_with_similarity(0.9))]
            })
        }
    }

    #[test]
    fn video_to_video_pairs_faces_seen_in_both() {
        let dir = tempfile::tempdir().unwrap();
        let opener = ScriptedOpener::new(SourceInfo {
            fps: Some(30.0),
            width: 320,
            height: 240,
            duration: Some(Duration::from_secs(1)),
        });
        let clip = |width, height| {
            let mut steps: Vec<Step> = (0..30).map(|_| Step::Frame(RgbImage::new(width, height))).collect();
            steps.push(Step::End);
            steps
        };
        opener.push(clip(320, 240));
        opener.push(clip(640, 480));
        let runner = JobRunner::new(
            DetectionEngine::new(Arc::new(TwoVideos)),
            Arc::new(WatchlistGallery::default()),
            Arc::new(opener),
            dir.path(),
        );

        let request = JobRequest::VideoToVideo {
            video_a_path: dir.path().join("a.mp4"),
            video_b_path: dir.path().join("b.mp4"),
            threshold: 0.6,
        };
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let progress = JobProgress::new(
            Box::new(move |p| sink.lock().unwrap().push(p)),
            CancellationToken::new(),
        );
        let result = runner.run("job-v2v", &request, &progress).unwrap();

        assert_eq!(result["faces_a"], 2);
        assert_eq!(result["videoA"]["name"], "a.mp4");
        let pairs: Vec<FacePair> = serde_json::from_value(result["pairs"].clone()).unwrap();
        assert_eq!(pairs.len(), 1);
        let pair = &pairs[0];
        assert!((pair.confidence - 0.9).abs() < 1e-3);
        assert_eq!(pair.a.frame, 0);
        assert_eq!(pair.a.bbox, BBox::new(10, 10, 90, 110));
        assert_eq!(pair.b.frame, 0);
        assert!((pair.b.time - 0.0).abs() < 1e-9);
        assert!(pair.a.thumb_relpath.starts_with("jobs/job-v2v/images/v2v_A_0_"));
        assert!(dir.path().join(&pair.b.thumb_relpath).exists());
        assert!(result["pairs"][0].get("A").is_some());

        let reported = reported.lock().unwrap();
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert!(reported.iter().any(|p| *p > 0.5));
        assert!(reported.iter().all(|p| *p < 1.0));
    }

    #[test]
    fn video_to_video_without_common_faces_has_no_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let opener = ScriptedOpener::new(SourceInfo {
            fps: Some(30.0),
            width: 160,
            height: 160,
            duration: None,
        });
        opener.push(vec![Step::Frame(RgbImage::new(160, 160)), Step::End]);
        opener.push(vec![Step::Frame(RgbImage::new(320, 240)), Step::End]);
        let runner = JobRunner::new(
            DetectionEngine::new(Arc::new(StrangerInVideo)),
            Arc::new(WatchlistGallery::default()),
            Arc::new(opener),
            dir.path(),
        );

        let request = JobRequest::VideoToVideo {
            video_a_path: dir.path().join("a.mp4"),
            video_b_path: dir.path().join("b.mp4"),
            threshold: 0.6,
        };
        let result = runner.run("job-v2v-2", &request, &JobProgress::detached()).unwrap();

        assert_eq!(result["faces_a"], 1);
        assert_eq!(result["pairs"], json!([]));
        assert!(!dir.path().join("jobs/job-v2v-2").exists());
    }

    #[test]
    fn known_image_without_face_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), ScriptedAnalyzer::new(Vec::new()), file_opener(3, 30.0));

        let request = JobRequest::PicToVideo {
            known_relpath: "uploads/known.jpg".to_string(),
            known_path: known_image(dir.path()),
            video_path: dir.path().join("clip.mp4"),
            threshold: 0.6,
        };
        let err = runner.run("job-3", &request, &JobProgress::detached()).unwrap_err();
        assert_eq!(err.to_string(), "Job error: No face found in known image");
    }

    #[test]
    fn video_analysis_aggregates_faces() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = ScriptedAnalyzer::new(vec![
            face(BBox::new(10, 10, 90, 110), embedding_with_similarity(0.9)),
            face(BBox::new(150, 20, 230, 120), embedding_at(1.5)),
        ]);
        let runner = runner(dir.path(), analyzer, file_opener(10, 10.0));

        let request = JobRequest::VideoAnalysis {
            video_path: dir.path().join("clip.mp4"),
            threshold: 0.6,
            use_watchlist: true,
            skip_frames: 2,
        };
        let value = runner.run("video_1_abcd1234", &request, &JobProgress::detached()).unwrap();
        assert!(value.get("totalFrames").is_some());
        let result: AnalysisResult = serde_json::from_value(value).unwrap();

        assert_eq!(result.total_frames, 10);
        assert_eq!(result.processed_frames, 5);
        assert_eq!(result.total_faces, 10);
        assert_eq!(result.matched_faces, 5);
        assert_eq!(result.unique_faces, 2);
        assert_eq!(result.detections[0].frame, 1);
        assert_eq!(result.detections[1].frame, 3);
        assert_eq!(result.summary.statistics.max_faces_in_frame, 2);
        assert_eq!(result.summary.statistics.avg_faces_per_frame, 2.0);

        let alice = &result.detections[0].faces[0];
        assert!(alice.matched);
        assert_eq!(alice.person_name.as_deref(), Some("Alice"));
        assert!(alice.frame_path.is_some());
        assert!(result.detections[0].faces[1].frame_path.is_none());

        let csv = result.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("Frame,Timestamp,Faces_Count,Matched_Count,Person_Names"));
        assert_eq!(lines.next(), Some("1,0,2,1,Alice"));
    }

    #[test]
    fn analysis_without_watchlist_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = ScriptedAnalyzer::new(vec![face(BBox::new(10, 10, 90, 110), embedding_at(0.0))]);
        let runner = runner(dir.path(), analyzer, file_opener(2, 10.0));

        let request = JobRequest::VideoAnalysis {
            video_path: dir.path().join("clip.mp4"),
            threshold: 0.6,
            use_watchlist: false,
            skip_frames: 1,
        };
        let value = runner.run("video_2", &request, &JobProgress::detached()).unwrap();
        let result: AnalysisResult = serde_json::from_value(value).unwrap();
        assert_eq!(result.matched_faces, 0);
        assert_eq!(result.detections[0].faces[0].similarity, 0.0);
    }

    #[test]
    fn rtsp_analysis_stops_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let opener = ScriptedOpener::new(SourceInfo {
            fps: Some(25.0),
            width: 320,
            height: 240,
            duration: None,
        });
        opener.push_repeating(Vec::new(), RgbImage::new(320, 240));
        let runner = runner(dir.path(), ScriptedAnalyzer::new(Vec::new()), Arc::new(opener));

        let request = JobRequest::RtspAnalysis {
            camera_id: "cam-1".to_string(),
            url: "rtsp://10.0.0.7/live".to_string(),
            transport: crate::db::models::camera_models::Transport::Tcp,
            timeout_ms: 1000,
            duration_secs: 1,
            threshold: 0.6,
            use_watchlist: true,
            skip_frames: 1,
        };
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let progress = JobProgress::new(
            Box::new(move |p| sink.lock().unwrap().push(p)),
            CancellationToken::new(),
        );

        let started = Instant::now();
        let value = runner.run("rtsp_1", &request, &progress).unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));

        let result: AnalysisResult = serde_json::from_value(value).unwrap();
        assert!(result.processed_frames > 0);
        assert_eq!(result.total_frames, result.processed_frames);
        assert!(result.summary.video_info.duration >= 1.0);

        let reported = reported.lock().unwrap();
        assert!(!reported.is_empty());
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert!(reported.iter().all(|p| *p < 1.0));
    }

    #[test]
    fn cancelled_job_stops() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path(), ScriptedAnalyzer::new(Vec::new()), file_opener(5, 10.0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = JobRequest::VideoAnalysis {
            video_path: dir.path().join("clip.mp4"),
            threshold: 0.6,
            use_watchlist: true,
            skip_frames: 1,
        };
        let err = runner
            .run("video_3", &request, &JobProgress::new(Box::new(|_| {}), cancel))
            .unwrap_err();
        assert!(matches!(err, Error::Job(_)));
    }
}
