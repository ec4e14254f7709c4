use crate::error::Error;
use crate::media::imaging;
use crate::recognition::{cosine_similarity, DetectionEngine};
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};

const COMPARE_DIR: &str = "compare";
const COMPARE_QUALITY: u8 = 90;

#[derive(Debug, Clone, Serialize)]
pub struct ComparedImage {
    pub relpath: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub similarity: f32,
    pub is_same_person: bool,
    pub threshold: f32,
    pub image1: ComparedImage,
    pub image2: ComparedImage,
}

/// Embedding of the best face in an encoded image; `None` when there is no
/// face. Undecodable bytes are a validation error.
pub async fn face_embedding(engine: DetectionEngine, bytes: Bytes) -> Result<Option<Vec<f32>>, Error> {
    tokio::task::spawn_blocking(move || -> Result<Option<Vec<f32>>, Error> {
        let image = imaging::decode_image(&bytes)?;
        Ok(engine.best_face(&image)?.map(|face| face.embedding))
    })
    .await
    .map_err(|e| Error::Internal(format!("Face task panicked: {}", e)))?
}

/// Compare the best face of two images. Both images are kept under
/// `compare/` with their face outlined.
pub async fn compare(
    engine: DetectionEngine,
    data_dir: PathBuf,
    image1: Bytes,
    image2: Bytes,
    threshold: f32,
) -> Result<Comparison, Error> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::Validation(
            "threshold must be between 0 and 1".to_string(),
        ));
    }

    tokio::task::spawn_blocking(move || {
        compare_blocking(&engine, &data_dir, &image1, &image2, threshold)
    })
    .await
    .map_err(|e| Error::Internal(format!("Compare task panicked: {}", e)))?
}

fn compare_blocking(
    engine: &DetectionEngine,
    data_dir: &Path,
    image1: &[u8],
    image2: &[u8],
    threshold: f32,
) -> Result<Comparison, Error> {
    let mut first = imaging::decode_image(image1)?;
    let mut second = imaging::decode_image(image2)?;

    let (face1, face2) = match (engine.best_face(&first)?, engine.best_face(&second)?) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(Error::Validation(
                "No face detected in one of the images".to_string(),
            ))
        }
    };

    let similarity = cosine_similarity(&face1.embedding, &face2.embedding);
    let same = similarity >= threshold;

    imaging::draw_box(&mut first, &face1.bbox, same);
    imaging::draw_box(&mut second, &face2.bbox, same);
    let relpath1 = imaging::save_jpeg(data_dir, COMPARE_DIR, "compare_a", &first, COMPARE_QUALITY)?;
    let relpath2 = imaging::save_jpeg(data_dir, COMPARE_DIR, "compare_b", &second, COMPARE_QUALITY)?;

    Ok(Comparison {
        similarity: (similarity * 1e6).round() / 1e6,
        is_same_person: same,
        threshold,
        image1: ComparedImage { relpath: relpath1 },
        image2: ComparedImage { relpath: relpath2 },
    })
}
