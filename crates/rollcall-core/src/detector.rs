//! Person detection and face-region derivation.
//!
//! A [`DetectionModel`] produces labeled boxes for a frame. [`FaceDetector`]
//! keeps the person boxes and projects each onto its upper part, where the
//! face is assumed to be. [`YoloModel`] is the ONNX Runtime implementation
//! for YOLOv8 exports (`[1, 4 + classes, candidates]` output).

use crate::types::{BoundingBox, Detection, FaceRegion};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const YOLO_INPUT_SIZE: usize = 640;
/// Letterbox fill value used by Ultralytics preprocessing.
const YOLO_PAD_VALUE: f32 = 114.0;
const YOLO_BBOX_FEATURES: usize = 4;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
pub const DEFAULT_FACE_FRACTION: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (export yolov8n to ONNX first)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face fraction must be in (0, 1], got {0}")]
    InvalidFaceFraction(f32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Object-detection model seam.
///
/// Implementations return every box they find; class filtering happens in
/// [`FaceDetector`]. Boxes are in frame pixel coordinates.
pub trait DetectionModel: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// YOLOv8 object detector over ONNX Runtime.
pub struct YoloModel {
    session: Session,
    input_size: usize,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl YoloModel {
    /// Load a YOLOv8 ONNX export from the given path.
    pub fn load(
        model_path: &str,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            confidence_threshold,
            nms_threshold,
            "loaded YOLO model"
        );

        Ok(Self {
            session,
            input_size: YOLO_INPUT_SIZE,
            confidence_threshold,
            nms_threshold,
        })
    }

    /// Letterbox an RGB frame into a NCHW float tensor scaled to [0, 1].
    fn preprocess(&self, frame: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let size = self.input_size;

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;

        let resized = imageops::resize(frame, new_w as u32, new_h as u32, FilterType::Triangle);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let fill = YOLO_PAD_VALUE / 255.0;
        let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), fill);

        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x_start;
            let ty = y as usize + pad_y_start;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel.0[c] as f32 / 255.0;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl DetectionModel for YoloModel {
    fn name(&self) -> &'static str {
        "yolov8"
    }

    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output extraction: {e}")))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let (num_features, num_candidates) = match dims.as_slice() {
            [1, f, n] if *f > YOLO_BBOX_FEATURES => (*f, *n),
            _ => {
                return Err(DetectorError::InferenceFailed(format!(
                    "expected [1, 4+classes, candidates] output, got {dims:?}"
                )))
            }
        };

        let candidates = decode_output(
            data,
            num_features,
            num_candidates,
            &letterbox,
            self.confidence_threshold,
        );
        let mut result = nms(candidates, self.nms_threshold);
        for det in &mut result {
            det.bbox = det.bbox.clip(frame.width(), frame.height());
        }

        tracing::debug!(count = result.len(), "YOLO detection completed");
        Ok(result)
    }
}

/// Decode a channel-major YOLOv8 output (`[features][candidates]`).
///
/// Each candidate is `cx, cy, w, h` followed by one score per class. The best
/// class wins; candidates under `threshold` are dropped. Coordinates are mapped
/// from letterboxed input space back to frame pixels and truncated.
fn decode_output(
    data: &[f32],
    num_features: usize,
    num_candidates: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    if num_features <= YOLO_BBOX_FEATURES || data.len() < num_features * num_candidates {
        return Vec::new();
    }
    let at = |feature: usize, idx: usize| data[feature * num_candidates + idx];

    let mut detections = Vec::new();
    for idx in 0..num_candidates {
        let mut best_class = 0;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..num_features - YOLO_BBOX_FEATURES {
            let score = at(YOLO_BBOX_FEATURES + class, idx);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, idx), at(1, idx), at(2, idx), at(3, idx));
        let to_x = |v: f32| ((v - letterbox.pad_x) / letterbox.scale) as i32;
        let to_y = |v: f32| ((v - letterbox.pad_y) / letterbox.scale) as i32;

        detections.push(Detection {
            bbox: BoundingBox::new(
                to_x(cx - w / 2.0),
                to_y(cy - h / 2.0),
                to_x(cx + w / 2.0),
                to_y(cy + h / 2.0),
            ),
            class_id: best_class,
            confidence: best_score,
        });
    }

    detections
}

/// Class-aware Non-Maximum Suppression, returning survivors by descending confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] || detections[i].class_id != detections[j].class_id {
                continue;
            }
            if iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter = BoundingBox::new(a.x1.max(b.x1), a.y1.max(b.y1), a.x2.min(b.x2), a.y2.min(b.y2));
    let inter_area = inter.area() as f32;
    let union_area = a.area() as f32 + b.area() as f32 - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Upper `fraction` of a person box, full width.
///
/// The face height is truncated to whole pixels: `(10,10,110,210)` at 0.4
/// gives `(10,10,110,90)`.
pub fn face_region(person: &BoundingBox, fraction: f32) -> BoundingBox {
    let face_height = (person.height() as f64 * fraction as f64).floor() as i32;
    BoundingBox::new(person.x1, person.y1, person.x2, person.y1 + face_height)
}

/// Finds people in a frame and derives one face region per person.
pub struct FaceDetector {
    model: Box<dyn DetectionModel>,
    face_fraction: f32,
}

impl FaceDetector {
    pub fn new(model: Box<dyn DetectionModel>, face_fraction: f32) -> Result<Self, DetectorError> {
        if !(face_fraction > 0.0 && face_fraction <= 1.0) {
            return Err(DetectorError::InvalidFaceFraction(face_fraction));
        }
        tracing::debug!(model = model.name(), face_fraction, "face detector ready");
        Ok(Self {
            model,
            face_fraction,
        })
    }

    pub fn face_fraction(&self) -> f32 {
        self.face_fraction
    }

    /// Detect face regions in a frame.
    ///
    /// Non-person detections are dropped; regions are clipped to the frame and
    /// empty ones discarded. No state carries over between calls.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let detections = self.model.infer(frame)?;

        let regions: Vec<FaceRegion> = detections
            .iter()
            .filter(|d| d.is_person())
            .filter_map(|d| {
                let bounds = face_region(&d.bbox, self.face_fraction).clip(frame.width(), frame.height());
                if bounds.is_empty() {
                    return None;
                }
                let pixels = imageops::crop_imm(
                    frame,
                    bounds.x1 as u32,
                    bounds.y1 as u32,
                    bounds.width() as u32,
                    bounds.height() as u32,
                )
                .to_image();
                Some(FaceRegion {
                    bounds,
                    person: d.bbox,
                    pixels,
                })
            })
            .collect();

        tracing::debug!(
            detections = detections.len(),
            faces = regions.len(),
            "face regions derived"
        );
        Ok(regions)
    }
}
