use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Label reported for a face that matches no enrolled identity.
pub const UNRECOGNIZED: &str = "Unknown";

/// COCO class index of "person" in YOLO detection outputs.
pub const PERSON_CLASS: usize = 0;

/// Axis-aligned box in frame pixel coordinates (`x1 < x2`, `y1 < y2` when non-empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
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
        self.area() == 0
    }

    /// Clamp the box to a `width` x `height` frame.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let w = width as i32;
        let h = height as i32;
        Self {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        }
    }
}

/// One labeled box produced by the detection model for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// COCO class ID (0 = person).
    pub class_id: usize,
    pub confidence: f32,
}

impl Detection {
    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS
    }
}

/// The part of a person detection presumed to contain a face.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    /// Face sub-rectangle, clipped to the frame.
    pub bounds: BoundingBox,
    /// The person detection the face was derived from.
    pub person: BoundingBox,
    /// Pixels inside `bounds`.
    pub pixels: RgbImage,
}

impl FaceRegion {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Appearance feature vector for an image region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Embedding function that produced this vector (e.g., "mean_rgb").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled person: name plus reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub embedding: Embedding,
    /// Enrollment image the embedding was computed from.
    pub source: PathBuf,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance to the nearest identity (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// Name of the matched identity (if any).
    pub name: Option<String>,
}

impl MatchResult {
    pub fn unrecognized(distance: f32) -> Self {
        Self {
            matched: false,
            distance,
            name: None,
        }
    }

    /// Matched name, or [`UNRECOGNIZED`].
    pub fn label(&self) -> &str {
        match (&self.name, self.matched) {
            (Some(name), true) => name,
            _ => UNRECOGNIZED,
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    fn compare(&self, query: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult;
}

/// Nearest-neighbor matcher over Euclidean distance with a rejection threshold.
///
/// Ties resolve to the first identity in gallery order.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let dist = query.euclidean_distance(&identity.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= threshold => MatchResult {
                matched: true,
                distance: best_dist,
                name: Some(gallery[idx].name.clone()),
            },
            _ => MatchResult::unrecognized(best_dist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, values: Vec<f32>) -> Identity {
        Identity {
            name: name.into(),
            embedding: Embedding { values, model_version: None },
            source: PathBuf::from(format!("{name}.png")),
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding { values: vec![0.0, 0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![3.0, 4.0, 0.0], model_version: None };
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_bbox_clip_and_area() {
        let b = BoundingBox::new(-5, 10, 700, 500);
        let clipped = b.clip(640, 480);
        assert_eq!(clipped, BoundingBox::new(0, 10, 640, 480));
        assert_eq!(clipped.area(), 640 * 470);
        assert!(BoundingBox::new(10, 10, 10, 50).is_empty());
        assert!(BoundingBox::new(700, 10, 800, 50).clip(640, 480).is_empty());
    }

    #[test]
    fn test_bbox_inverted_is_empty() {
        let b = BoundingBox::new(50, 50, 10, 10);
        assert_eq!(b.width(), 0);
        assert!(b.is_empty());
    }

    #[test]
    fn test_matcher_exact_match() {
        let query = Embedding { values: vec![120.0, 80.0, 60.0], model_version: None };
        let gallery = vec![
            identity("alice", vec![10.0, 10.0, 10.0]),
            identity("bob", vec![120.0, 80.0, 60.0]),
        ];
        let result = EuclideanMatcher.compare(&query, &gallery, 50.0);
        assert!(result.matched);
        assert_eq!(result.label(), "bob");
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_matcher_rejects_beyond_threshold() {
        let query = Embedding { values: vec![200.0, 200.0, 200.0], model_version: None };
        let gallery = vec![
            identity("alice", vec![10.0, 10.0, 10.0]),
            identity("bob", vec![100.0, 100.0, 100.0]),
        ];
        let result = EuclideanMatcher.compare(&query, &gallery, 50.0);
        assert!(!result.matched);
        assert_eq!(result.label(), UNRECOGNIZED);
        assert!(result.distance > 50.0);
    }

    #[test]
    fn test_matcher_tie_goes_to_first() {
        let query = Embedding { values: vec![50.0, 50.0, 50.0], model_version: None };
        let gallery = vec![
            identity("carol", vec![40.0, 50.0, 50.0]),
            identity("dave", vec![60.0, 50.0, 50.0]),
        ];
        for _ in 0..3 {
            let result = EuclideanMatcher.compare(&query, &gallery, 50.0);
            assert_eq!(result.label(), "carol");
        }
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let query = Embedding { values: vec![1.0, 2.0, 3.0], model_version: None };
        let result = EuclideanMatcher.compare(&query, &[], 50.0);
        assert!(!result.matched);
        assert_eq!(result.label(), UNRECOGNIZED);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_detection_is_person() {
        let det = Detection {
            bbox: BoundingBox::new(0, 0, 10, 10),
            class_id: 2,
            confidence: 0.9,
        };
        assert!(!det.is_person());
    }
}
