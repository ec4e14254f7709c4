//! Face detection and identity matching.
//!
//! The model runtime sits behind [`FaceAnalyzer`]; [`DetectionEngine`] adds
//! embedding normalisation, quality scoring and matching on top of it. The
//! engine holds no per-call state, so live workers and batch jobs share one
//! instance.

use crate::error::Error;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod gallery;
pub mod onnx;
pub mod quality;

pub use gallery::{Gallery, GalleryEntry, WatchlistGallery};
pub use quality::QualityReport;

/// Axis-aligned box in pixel coordinates, serialised as `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl From<[i32; 4]> for BBox {
    fn from(v: [i32; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersect with a `width` x `height` image
    pub fn clamp(&self, width: u32, height: u32) -> BBox {
        let (w, h) = (width as i32, height as i32);
        BBox::new(
            self.x1.clamp(0, w),
            self.y1.clamp(0, h),
            self.x2.clamp(0, w),
            self.y2.clamp(0, h),
        )
    }

    /// Grow by `pad` pixels on every side, staying inside the image
    pub fn padded(&self, pad: i32, width: u32, height: u32) -> BBox {
        BBox::new(self.x1 - pad, self.y1 - pad, self.x2 + pad, self.y2 + pad).clamp(width, height)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = BBox::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        )
        .area();
        let union = self.area() + other.area() - inter;
        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// Raw output of a face model for one face
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BBox,
    pub score: f32,
    pub embedding: Vec<f32>,
    pub age: Option<f32>,
    pub gender: Option<String>,
}

/// Model runtime seam. Implementations may block; callers run them on a
/// blocking thread.
pub trait FaceAnalyzer: Send + Sync {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, Error>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// A detected face ready for matching
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    /// Clamped to the frame
    pub bbox: BBox,
    pub det_score: f32,
    /// L2-normalised
    pub embedding: Vec<f32>,
    pub quality: QualityReport,
    pub age: Option<f32>,
    pub gender: Option<String>,
}

/// What a face is compared against
#[derive(Debug, Clone)]
pub enum MatchSet {
    /// One reference embedding
    Single(Arc<Vec<f32>>),
    /// Snapshot of the enrolled watchlist
    Watchlist(Arc<Gallery>),
}

/// Outcome of matching one face
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub matched: bool,
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    /// Best similarity found, also reported for non-matches
    pub similarity: f32,
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity of two normalised embeddings. Mismatched lengths
/// never match.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Label given to single-mode hits, which have no enrolled person behind them
pub const KNOWN_FACE_LABEL: &str = "Known face";

#[derive(Clone)]
pub struct DetectionEngine {
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl DetectionEngine {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { analyzer }
    }

    pub fn model_name(&self) -> &str {
        self.analyzer.model_name()
    }

    /// Every usable face in `frame`
    pub fn detect(&self, frame: &RgbImage) -> Result<Vec<FaceCandidate>, Error> {
        let faces = self.analyzer.analyze(frame)?;
        let mut candidates = Vec::with_capacity(faces.len());

        for face in faces {
            let bbox = face.bbox.clamp(frame.width(), frame.height());
            if bbox.is_empty() || face.embedding.is_empty() {
                continue;
            }
            let quality = quality::assess(frame, &face.bbox);
            let mut embedding = face.embedding;
            l2_normalize(&mut embedding);

            candidates.push(FaceCandidate {
                bbox,
                det_score: face.score,
                embedding,
                quality,
                age: face.age,
                gender: face.gender,
            });
        }

        Ok(candidates)
    }

    /// Highest scoring face, used for reference images
    pub fn best_face(&self, frame: &RgbImage) -> Result<Option<FaceCandidate>, Error> {
        Ok(self.detect(frame)?.into_iter().max_by(|a, b| {
            a.det_score
                .partial_cmp(&b.det_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.bbox.area().cmp(&b.bbox.area()))
        }))
    }

    pub fn recognize(&self, candidate: &FaceCandidate, set: &MatchSet, threshold: f32) -> Verdict {
        recognize(&candidate.embedding, set, threshold)
    }
}

/// Match an embedding against `set`. The best similarity wins when it
/// reaches `threshold`; equal scores keep the earliest enrolment.
pub fn recognize(embedding: &[f32], set: &MatchSet, threshold: f32) -> Verdict {
    match set {
        MatchSet::Single(known) => {
            let similarity = cosine_similarity(embedding, known);
            let matched = similarity >= threshold;
            Verdict {
                matched,
                person_id: None,
                person_name: matched.then(|| KNOWN_FACE_LABEL.to_string()),
                similarity,
            }
        }
        MatchSet::Watchlist(gallery) => match gallery.best_match(embedding) {
            Some((entry, similarity)) if similarity >= threshold => Verdict {
                matched: true,
                person_id: Some(entry.person_id),
                person_name: Some(entry.person_name.clone()),
                similarity,
            },
            Some((_, similarity)) => Verdict {
                matched: false,
                person_id: None,
                person_name: None,
                similarity,
            },
            None => Verdict {
                matched: false,
                person_id: None,
                person_name: None,
                similarity: 0.0,
            },
        },
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn gallery() -> Arc<Gallery> {
        Arc::new(Gallery::new(vec![
            GalleryEntry {
                person_id: 1,
                person_name: "Alice".to_string(),
                embedding: embedding_at(0.0),
            },
            GalleryEntry {
                person_id: 2,
                person_name: "Bob".to_string(),
                embedding: embedding_at(-1.2),
            },
        ]))
    }

    #[test]
    fn bbox_geometry() {
        let b = BBox::new(-10, 5, 50, 300);
        let c = b.clamp(40, 100);
        assert_eq!(c, BBox::new(0, 5, 40, 100));
        assert_eq!(BBox::new(10, 10, 20, 20).padded(20, 100, 100), BBox::new(0, 0, 40, 40));
        assert!((BBox::new(0, 0, 10, 10).iou(&BBox::new(5, 0, 15, 10)) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(serde_json::to_string(&BBox::new(1, 2, 3, 4)).unwrap(), "[1,2,3,4]");
    }

    #[test]
    fn watchlist_best_match_above_threshold() {
        let set = MatchSet::Watchlist(gallery());
        let verdict = recognize(&embedding_with_similarity(0.82), &set, 0.6);
        assert!(verdict.matched);
        assert_eq!(verdict.person_id, Some(1));
        assert_eq!(verdict.person_name.as_deref(), Some("Alice"));
        assert!((verdict.similarity - 0.82).abs() < 1e-4);
    }

    #[test]
    fn below_threshold_reports_similarity_without_person() {
        let set = MatchSet::Watchlist(gallery());
        let verdict = recognize(&embedding_with_similarity(0.5), &set, 0.6);
        assert!(!verdict.matched);
        assert!(verdict.person_id.is_none());
        assert!(verdict.similarity > 0.45);

        let empty = MatchSet::Watchlist(Arc::new(Gallery::default()));
        assert_eq!(recognize(&embedding_at(0.0), &empty, 0.6).similarity, 0.0);
    }

    #[test]
    fn single_mode_compares_with_known_embedding() {
        let set = MatchSet::Single(Arc::new(embedding_at(0.0)));
        assert!(recognize(&embedding_with_similarity(0.7), &set, 0.6).matched);
        assert!(!recognize(&embedding_with_similarity(0.59), &set, 0.6).matched);
    }

    #[test]
    fn detect_normalises_and_drops_empty_boxes() {
        let analyzer = ScriptedAnalyzer::new(vec![
            face(BBox::new(10, 10, 60, 70), vec![3.0, 4.0, 0.0, 0.0]),
            face(BBox::new(500, 500, 600, 600), vec![1.0, 0.0, 0.0, 0.0]),
        ]);
        let engine = DetectionEngine::new(Arc::new(analyzer));
        let frame = RgbImage::new(200, 200);

        let faces = engine.detect(&frame).unwrap();
        assert_eq!(faces.len(), 1);
        assert!((faces[0].embedding[0] - 0.6).abs() < 1e-6);
        assert!((faces[0].embedding[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn analyzer_failure_is_a_recognition_error() {
        let engine = DetectionEngine::new(Arc::new(ScriptedAnalyzer::failing()));
        match engine.detect(&RgbImage::new(10, 10)) {
            Err(Error::Recognition(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|f| f.len())),
        }
    }
}
