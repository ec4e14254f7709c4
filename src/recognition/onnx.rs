use crate::config::RecognitionConfig;
use crate::error::Error;
use crate::recognition::{BBox, DetectedFace, FaceAnalyzer};
use anyhow::Context;
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::info;
use ndarray::{Array, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::Path;
use std::sync::Mutex;

/// Margin added around a detection before cropping it for the embedder
const EMBED_CROP_MARGIN: f32 = 0.1;

/// Two-stage ONNX analyzer: a YOLO-style face detector followed by an
/// ArcFace-style embedder. Sessions need exclusive access to run, so each
/// one sits behind a mutex.
pub struct OnnxFaceAnalyzer {
    detector: Mutex<Session>,
    detector_output: String,
    embedder: Mutex<Session>,
    embedder_output: String,
    config: RecognitionConfig,
    name: String,
}

impl OnnxFaceAnalyzer {
    pub fn load(config: &RecognitionConfig) -> Result<Self, Error> {
        let detector = create_session(&config.detector_model, config.intra_threads)?;
        let embedder = create_session(&config.embedder_model, config.intra_threads)?;

        let detector_output = first_output(&detector, &config.detector_model)?;
        let embedder_output = first_output(&embedder, &config.embedder_model)?;

        let name = format!(
            "{}+{}",
            file_stem(&config.detector_model),
            file_stem(&config.embedder_model)
        );
        info!("Loaded face models {}", name);

        Ok(Self {
            detector: Mutex::new(detector),
            detector_output,
            embedder: Mutex::new(embedder),
            embedder_output,
            config: config.clone(),
            name,
        })
    }

    /// NCHW tensor scaled to [0, 1]
    fn preprocess_for_detection(&self, image: &RgbImage) -> Array<f32, IxDyn> {
        let size = self.config.detection_input_size;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);

        let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
        input
    }

    /// NCHW tensor scaled to [-1, 1]
    fn preprocess_for_embedding(&self, face: &RgbImage) -> Array<f32, IxDyn> {
        let size = self.config.embedding_input_size;
        let resized = imageops::resize(face, size, size, FilterType::Triangle);

        let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 127.5 - 1.0;
            }
        }
        input
    }

    fn run_detector(&self, image: &RgbImage) -> Result<Vec<(BBox, f32)>, Error> {
        let input = Value::from_array(self.preprocess_for_detection(image)).map_err(model_error)?;

        let mut session = self
            .detector
            .lock()
            .map_err(|_| Error::Recognition("Detector session poisoned".to_string()))?;
        let outputs = session.run(ort::inputs![input]).map_err(model_error)?;
        let value = outputs
            .get(self.detector_output.as_str())
            .ok_or_else(|| Error::Recognition("No detection output tensor found".to_string()))?;
        let (shape, data) = value.try_extract_tensor::<f32>().map_err(model_error)?;
        let shape: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape), data.to_vec())
            .map_err(|e| Error::Recognition(format!("Unexpected detector output: {}", e)))?;

        Ok(self.postprocess_detection(&output, image.width(), image.height()))
    }

    /// Decode `[1, 5+, N]` (or transposed `[1, N, 5+]`) rows of
    /// cx, cy, w, h, score, then apply NMS.
    fn postprocess_detection(
        &self,
        output: &Array<f32, IxDyn>,
        width: u32,
        height: u32,
    ) -> Vec<(BBox, f32)> {
        let dims = output.shape();
        if dims.len() != 3 {
            return Vec::new();
        }
        let transposed = dims[1] > dims[2];
        let count = if transposed { dims[1] } else { dims[2] };
        let attr = |a: usize, i: usize| {
            if transposed {
                output[[0, i, a]]
            } else {
                output[[0, a, i]]
            }
        };

        let scale_x = width as f32 / self.config.detection_input_size as f32;
        let scale_y = height as f32 / self.config.detection_input_size as f32;

        let mut boxes = Vec::new();
        for i in 0..count {
            let score = attr(4, i);
            if score < self.config.detection_confidence {
                continue;
            }
            let (cx, cy, w, h) = (attr(0, i), attr(1, i), attr(2, i), attr(3, i));
            let bbox = BBox::new(
                ((cx - w / 2.0) * scale_x) as i32,
                ((cy - h / 2.0) * scale_y) as i32,
                ((cx + w / 2.0) * scale_x) as i32,
                ((cy + h / 2.0) * scale_y) as i32,
            );
            boxes.push((bbox, score));
        }

        let mut kept = non_max_suppression(boxes, self.config.iou_threshold);
        kept.truncate(self.config.max_faces);
        kept
    }

    fn embed(&self, image: &RgbImage, bbox: &BBox) -> Result<Vec<f32>, Error> {
        let margin = (bbox.width().max(bbox.height()) as f32 * EMBED_CROP_MARGIN) as i32;
        let region = bbox.padded(margin, image.width(), image.height());
        if region.is_empty() {
            return Err(Error::Recognition("Face crop is empty".to_string()));
        }
        let face = imageops::crop_imm(
            image,
            region.x1 as u32,
            region.y1 as u32,
            region.width() as u32,
            region.height() as u32,
        )
        .to_image();

        let input = Value::from_array(self.preprocess_for_embedding(&face)).map_err(model_error)?;

        let mut session = self
            .embedder
            .lock()
            .map_err(|_| Error::Recognition("Embedder session poisoned".to_string()))?;
        let outputs = session.run(ort::inputs![input]).map_err(model_error)?;
        let value = outputs
            .get(self.embedder_output.as_str())
            .ok_or_else(|| Error::Recognition("No embedding output tensor found".to_string()))?;
        let (_, data) = value.try_extract_tensor::<f32>().map_err(model_error)?;

        Ok(data.to_vec())
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, Error> {
        let boxes = self.run_detector(image)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, score) in boxes {
            let embedding = self.embed(image, &bbox)?;
            faces.push(DetectedFace {
                bbox,
                score,
                embedding,
                age: None,
                gender: None,
            });
        }
        Ok(faces)
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// Greedy NMS, highest score first
pub fn non_max_suppression(mut boxes: Vec<(BBox, f32)>, iou_threshold: f32) -> Vec<(BBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep
            .iter()
            .all(|(kept, _)| kept.iou(&candidate.0) < iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn create_session(path: &Path, intra_threads: usize) -> Result<Session, Error> {
    if !path.exists() {
        return Err(Error::Config(format!("Model file not found: {}", path.display())));
    }

    let build = || -> anyhow::Result<Session> {
        let session = Session::builder()
            .context("Failed to create session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?
            .with_intra_threads(intra_threads)
            .context("Failed to set intra threads")?
            .commit_from_file(path)
            .context("Failed to load model from file")?;
        Ok(session)
    };

    build().map_err(|e| Error::Recognition(format!("Failed to load model {}: {:#}", path.display(), e)))
}

fn first_output(session: &Session, path: &Path) -> Result<String, Error> {
    session
        .outputs
        .first()
        .map(|o| o.name.clone())
        .ok_or_else(|| Error::Recognition(format!("Model {} has no outputs", path.display())))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}

fn model_error(e: ort::Error) -> Error {
    Error::Recognition(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_boxes() {
        let boxes = vec![
            (BBox::new(0, 0, 100, 100), 0.8),
            (BBox::new(5, 5, 105, 105), 0.9),
            (BBox::new(300, 300, 350, 350), 0.6),
        ];
        let kept = non_max_suppression(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, BBox::new(5, 5, 105, 105));
        assert_eq!(kept[1].0, BBox::new(300, 300, 350, 350));
    }

    #[test]
    fn missing_model_is_a_config_error() {
        let config = RecognitionConfig {
            detector_model: "does/not/exist.onnx".into(),
            ..RecognitionConfig::default()
        };
        assert!(matches!(OnnxFaceAnalyzer::load(&config), Err(Error::Config(_))));
    }
}
