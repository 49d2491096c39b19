//! rollcall-core — Attendance scanning engine.
//!
//! Finds people with a YOLOv8 detector (ONNX Runtime), takes the upper part
//! of each person box as the face region, matches it against an enrolled
//! gallery, and records at most one attendance event per identity per day.

pub mod detector;
pub mod embedding;
pub mod gallery;
pub mod ledger;
pub mod recognizer;
pub mod scanner;
pub mod types;

pub use detector::{DetectionModel, DetectorError, FaceDetector, YoloModel};
pub use embedding::{EmbeddingFn, MeanColorEmbedder};
pub use gallery::{GalleryError, GalleryStore};
pub use ledger::{AttendanceEvent, Clock, Ledger, LedgerError, SystemClock};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use scanner::{draw_annotations, Annotation, ScanError, Scanner};
pub use types::{
    BoundingBox, Detection, Embedding, EuclideanMatcher, FaceRegion, Identity, MatchResult,
    Matcher, UNRECOGNIZED,
};
