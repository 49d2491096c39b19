//! Embedding functions.
//!
//! Enrollment and recognition must use the same [`EmbeddingFn`], otherwise
//! distances between gallery and query vectors are meaningless.

use crate::types::Embedding;
use image::RgbImage;
use thiserror::Error;

const MEAN_COLOR_VERSION: &str = "mean_rgb";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("cannot embed an empty image")]
    EmptyImage,
}

/// Maps an image region to a fixed-length feature vector.
pub trait EmbeddingFn: Send + Sync {
    /// Identifier stored in [`Embedding::model_version`].
    fn version(&self) -> &str;

    fn embed(&self, image: &RgbImage) -> Result<Embedding, EmbeddingError>;
}

/// Coarse appearance signature: the mean of each RGB channel.
///
/// Produces a 3-component vector in 0..=255 per component. It summarizes
/// color, not facial geometry.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanColorEmbedder;

impl EmbeddingFn for MeanColorEmbedder {
    fn version(&self) -> &str {
        MEAN_COLOR_VERSION
    }

    fn embed(&self, image: &RgbImage) -> Result<Embedding, EmbeddingError> {
        let count = image.width() as u64 * image.height() as u64;
        if count == 0 {
            return Err(EmbeddingError::EmptyImage);
        }

        let mut sums = [0u64; 3];
        for pixel in image.pixels() {
            for (sum, &channel) in sums.iter_mut().zip(pixel.0.iter()) {
                *sum += channel as u64;
            }
        }

        Ok(Embedding {
            values: sums.iter().map(|&s| (s as f64 / count as f64) as f32).collect(),
            model_version: Some(MEAN_COLOR_VERSION.to_string()),
        })
    }
}
