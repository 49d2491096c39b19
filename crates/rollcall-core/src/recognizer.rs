//! Nearest-identity face recognizer.
//!
//! Embeds a face region with a pluggable [`EmbeddingFn`] and matches it
//! against the enrolled gallery under a rejection threshold.

use crate::embedding::{EmbeddingError, EmbeddingFn};
use crate::types::{EuclideanMatcher, Identity, MatchResult, Matcher};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

/// Maximum Euclidean distance (in embedding units) still accepted as a match.
pub const DEFAULT_RECOGNITION_THRESHOLD: f32 = 50.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Embedding-based face recognizer.
pub struct FaceRecognizer {
    embedder: Arc<dyn EmbeddingFn>,
    matcher: Box<dyn Matcher>,
    threshold: f32,
}

impl FaceRecognizer {
    pub fn new(embedder: Arc<dyn EmbeddingFn>, threshold: f32) -> Self {
        Self::with_matcher(embedder, Box::new(EuclideanMatcher), threshold)
    }

    pub fn with_matcher(
        embedder: Arc<dyn EmbeddingFn>,
        matcher: Box<dyn Matcher>,
        threshold: f32,
    ) -> Self {
        tracing::debug!(embedder = embedder.version(), threshold, "recognizer ready");
        Self {
            embedder,
            matcher,
            threshold,
        }
    }

    /// The embedding function shared with gallery loading.
    pub fn embedder(&self) -> &dyn EmbeddingFn {
        self.embedder.as_ref()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Identify a face region against `gallery`.
    ///
    /// An empty gallery is always unrecognized. Pure with respect to its inputs.
    pub fn recognize(
        &self,
        face: &RgbImage,
        gallery: &[Identity],
    ) -> Result<MatchResult, RecognizerError> {
        if gallery.is_empty() {
            return Ok(MatchResult::unrecognized(f32::INFINITY));
        }

        let query = self.embedder.embed(face)?;
        let result = self.matcher.compare(&query, gallery, self.threshold);

        tracing::trace!(
            label = result.label(),
            distance = result.distance,
            "recognition result"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MeanColorEmbedder;
    use crate::types::{Embedding, UNRECOGNIZED};
    use image::Rgb;
    use std::path::PathBuf;

    fn enrolled(name: &str, color: [u8; 3]) -> Identity {
        let img = RgbImage::from_pixel(16, 16, Rgb(color));
        Identity {
            name: name.into(),
            embedding: MeanColorEmbedder.embed(&img).unwrap(),
            source: PathBuf::from(format!("{name}.png")),
        }
    }

    fn recognizer() -> FaceRecognizer {
        FaceRecognizer::new(Arc::new(MeanColorEmbedder), DEFAULT_RECOGNITION_THRESHOLD)
    }

    #[test]
    fn test_identical_embedding_recognized() {
        let gallery = vec![enrolled("alice", [200, 150, 120]), enrolled("bob", [40, 40, 40])];
        let face = RgbImage::from_pixel(30, 20, Rgb([200, 150, 120]));
        let result = recognizer().recognize(&face, &gallery).unwrap();
        assert!(result.matched);
        assert_eq!(result.label(), "alice");
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_nearest_within_threshold() {
        let gallery = vec![enrolled("alice", [200, 150, 120]), enrolled("bob", [40, 40, 40])];
        let face = RgbImage::from_pixel(10, 10, Rgb([50, 45, 40]));
        let result = recognizer().recognize(&face, &gallery).unwrap();
        assert_eq!(result.label(), "bob");
    }

    #[test]
    fn test_far_from_everyone_unrecognized() {
        let gallery = vec![enrolled("alice", [0, 0, 0]), enrolled("bob", [0, 0, 255])];
        let face = RgbImage::from_pixel(10, 10, Rgb([255, 255, 0]));
        let result = recognizer().recognize(&face, &gallery).unwrap();
        assert!(!result.matched);
        assert_eq!(result.label(), UNRECOGNIZED);
    }

    #[test]
    fn test_empty_gallery_unrecognized() {
        let face = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        let result = recognizer().recognize(&face, &[]).unwrap();
        assert_eq!(result.label(), UNRECOGNIZED);
    }

    #[test]
    fn test_empty_face_is_error() {
        let gallery = vec![enrolled("alice", [1, 2, 3])];
        let face = RgbImage::new(0, 0);
        assert!(recognizer().recognize(&face, &gallery).is_err());
    }

    #[test]
    fn test_custom_matcher_is_used() {
        struct RejectAll;
        impl Matcher for RejectAll {
            fn compare(&self, _: &Embedding, _: &[Identity], _: f32) -> MatchResult {
                MatchResult::unrecognized(0.0)
            }
        }
        let gallery = vec![enrolled("alice", [9, 9, 9])];
        let face = RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]));
        let r = FaceRecognizer::with_matcher(Arc::new(MeanColorEmbedder), Box::new(RejectAll), 50.0);
        assert!(!r.recognize(&face, &gallery).unwrap().matched);
    }
}
