//! Frame sources consumed by the scan loop.
//!
//! A source is opened when scanning starts, read once per frame, and
//! released when scanning stops. Read failures are per-frame: the caller
//! decides whether to skip the frame or give up.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source is not open")]
    NotOpen,
    #[error("failed to open source {0}: {1}")]
    Open(String, String),
    #[error("frame read failed: {0}")]
    Read(String),
}

/// Produces frames on demand between `open` and `release`.
pub trait FrameSource: Send {
    /// Human-readable description (device path, directory).
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<(), SourceError>;

    /// Read the next frame. Errors are transient unless the source is closed.
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Release the underlying device. Safe to call when already released.
    fn release(&mut self);

    fn is_open(&self) -> bool;
}

/// Replays the images of a directory in file-name order, looping forever.
///
/// Stands in for a camera when running against recorded stills.
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    sequence: u32,
    open: bool,
}

impl ImageDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            next: 0,
            sequence: 0,
            open: false,
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageDirSource {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn open(&mut self) -> Result<(), SourceError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| SourceError::Open(self.describe(), e.to_string()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(SourceError::Open(self.describe(), "no images found".into()));
        }

        tracing::info!(dir = %self.dir.display(), frames = files.len(), "opened image directory source");
        self.files = files;
        self.next = 0;
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        self.sequence = self.sequence.wrapping_add(1);

        let image = image::open(path)
            .map_err(|e| SourceError::Read(format!("{}: {e}", path.display())))?
            .to_rgb8();

        Ok(Frame {
            image,
            timestamp: Instant::now(),
            sequence: self.sequence,
        })
    }

    fn release(&mut self) {
        if self.open {
            tracing::info!(dir = %self.dir.display(), "released image directory source");
        }
        self.open = false;
        self.files.clear();
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
