//! Per-frame attendance pipeline: detect → recognize → mark → annotate.

use crate::detector::{DetectorError, FaceDetector};
use crate::gallery::GalleryStore;
use crate::ledger::Ledger;
use crate::recognizer::FaceRecognizer;
use crate::types::{BoundingBox, UNRECOGNIZED};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;
use thiserror::Error;

/// Regions narrower or shorter than this are treated as false positives.
pub const DEFAULT_MIN_FACE_SIZE: u32 = 20;

const RECOGNIZED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNRECOGNIZED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("detection failed: {0}")]
    Detection(#[from] DetectorError),
}

/// Display-surface record for one face region in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub person: BoundingBox,
    pub face: BoundingBox,
    /// Recognized name, or [`UNRECOGNIZED`].
    pub name: String,
    pub distance: f32,
    /// True when this frame produced the identity's attendance record.
    pub marked: bool,
}

impl Annotation {
    pub fn is_recognized(&self) -> bool {
        self.name != UNRECOGNIZED
    }

    /// Caption text: the name, with a check mark when newly recorded.
    pub fn caption(&self) -> String {
        if self.marked {
            format!("{} ✓", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Runs the detection/recognition/ledger chain over single frames.
pub struct Scanner {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    min_face_size: u32,
}

impl Scanner {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer, min_face_size: u32) -> Self {
        Self {
            detector,
            recognizer,
            min_face_size,
        }
    }

    pub fn recognizer(&self) -> &FaceRecognizer {
        &self.recognizer
    }

    /// Process one frame.
    ///
    /// A detection failure fails the whole frame. Recognition or ledger
    /// failures affect only their region, which is logged and annotated
    /// as unmarked.
    pub fn process(
        &mut self,
        frame: &RgbImage,
        gallery: &GalleryStore,
        ledger: &mut Ledger,
    ) -> Result<Vec<Annotation>, ScanError> {
        let regions = self.detector.detect(frame)?;
        let mut annotations = Vec::with_capacity(regions.len());

        for region in regions {
            if region.width() < self.min_face_size || region.height() < self.min_face_size {
                tracing::trace!(
                    width = region.width(),
                    height = region.height(),
                    "skipping undersized face region"
                );
                continue;
            }

            let (name, distance) = match self.recognizer.recognize(&region.pixels, gallery.identities()) {
                Ok(result) => (result.label().to_string(), result.distance),
                Err(e) => {
                    tracing::warn!(error = %e, "recognition failed for face region");
                    (UNRECOGNIZED.to_string(), f32::INFINITY)
                }
            };

            let marked = if name == UNRECOGNIZED {
                false
            } else {
                ledger.mark(&name).unwrap_or_else(|e| {
                    tracing::warn!(name = %name, error = %e, "failed to record attendance");
                    false
                })
            };

            annotations.push(Annotation {
                person: region.person,
                face: region.bounds,
                name,
                distance,
                marked,
            });
        }

        Ok(annotations)
    }
}

/// Draw person-box outlines for each annotation onto `frame`.
///
/// Recognized people are outlined green, everyone else red.
pub fn draw_annotations(frame: &mut RgbImage, annotations: &[Annotation]) {
    for annotation in annotations {
        let color = if annotation.is_recognized() {
            RECOGNIZED_COLOR
        } else {
            UNRECOGNIZED_COLOR
        };
        draw_box(frame, &annotation.person, color);
    }
}

fn draw_box(frame: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let b = bbox.clip(frame.width(), frame.height());

    // Nested one-pixel outlines, innermost last.
    for t in 0..BOX_THICKNESS {
        let (w, h) = (b.width() - 2 * t, b.height() - 2 * t);
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(b.x1 + t, b.y1 + t).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(frame, rect, color);
    }
}
