//! Enrolled-identity gallery backed by a directory of images.
//!
//! Each `<name>.{jpg,jpeg,png}` file is one identity. Embeddings are
//! recomputed from the images at load time with the same [`EmbeddingFn`]
//! the recognizer uses.

use crate::embedding::EmbeddingFn;
use crate::types::{Identity, UNRECOGNIZED};
use image::RgbImage;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const ENROLL_EXTENSION: &str = "png";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("no enrollment image for {0:?}")]
    NotEnrolled(String),
    #[error("failed to write enrollment image {path}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to remove enrollment image {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Create the gallery directory if it does not exist.
pub fn ensure_dir(dir: &Path) -> Result<(), GalleryError> {
    std::fs::create_dir_all(dir).map_err(|source| GalleryError::Directory {
        path: dir.to_path_buf(),
        source,
    })
}

/// Check that `name` can be used as an identity and a file stem.
pub fn validate_name(name: &str) -> Result<(), GalleryError> {
    let ok = !name.trim().is_empty()
        && name == name.trim()
        && name != UNRECOGNIZED
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(GalleryError::InvalidName(name.to_string()))
    }
}

fn is_enrollment_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Enrollment image paths in `dir`, sorted by file name. Absent dir → empty.
fn enrollment_images(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(GalleryError::Directory {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_enrollment_image(p))
        .collect();
    paths.sort();
    Ok(paths)
}

/// In-memory gallery of enrolled identities.
pub struct GalleryStore {
    dir: PathBuf,
    identities: Vec<Identity>,
}

impl GalleryStore {
    /// Load every decodable enrollment image in `dir`.
    ///
    /// A missing or empty directory yields an empty gallery. Images that fail
    /// to decode or embed are skipped with a warning.
    pub fn load(dir: &Path, embedder: &dyn EmbeddingFn) -> Result<Self, GalleryError> {
        let mut store = Self {
            dir: dir.to_path_buf(),
            identities: Vec::new(),
        };
        store.reload(embedder)?;
        Ok(store)
    }

    /// Rebuild the gallery from disk, replacing the in-memory identities.
    pub fn reload(&mut self, embedder: &dyn EmbeddingFn) -> Result<usize, GalleryError> {
        let mut identities = Vec::new();
        let mut seen = HashSet::new();

        for path in enrollment_images(&self.dir)? {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() {
                tracing::warn!(path = %path.display(), "skipping enrollment image with invalid name");
                continue;
            }
            if seen.contains(&name) {
                tracing::warn!(name = %name, path = %path.display(), "duplicate enrollment image ignored");
                continue;
            }

            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to decode enrollment image");
                    continue;
                }
            };
            let embedding = match embedder.embed(&image) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to embed enrollment image");
                    continue;
                }
            };

            seen.insert(name.clone());
            identities.push(Identity {
                name,
                embedding,
                source: path,
            });
        }

        tracing::info!(
            dir = %self.dir.display(),
            count = identities.len(),
            embedder = embedder.version(),
            "gallery loaded"
        );
        self.identities = identities;
        Ok(self.identities.len())
    }

    /// Enroll (or re-enroll) `name` from an image and reload the gallery.
    ///
    /// The image is stored as `<dir>/<name>.png`; other images for the same
    /// name are removed so the name stays unique.
    pub fn enroll(
        &mut self,
        name: &str,
        image: &RgbImage,
        embedder: &dyn EmbeddingFn,
    ) -> Result<PathBuf, GalleryError> {
        validate_name(name)?;
        ensure_dir(&self.dir)?;

        let path = self.dir.join(format!("{name}.{ENROLL_EXTENSION}"));
        image.save(&path).map_err(|source| GalleryError::Write {
            path: path.clone(),
            source,
        })?;
        for stale in self.images_for(name)? {
            if stale != path {
                remove_file(&stale)?;
            }
        }

        tracing::info!(name, path = %path.display(), "identity enrolled");
        self.reload(embedder)?;
        Ok(path)
    }

    /// Delete every enrollment image for `name` and reload the gallery.
    pub fn remove(&mut self, name: &str, embedder: &dyn EmbeddingFn) -> Result<(), GalleryError> {
        validate_name(name)?;
        let images = self.images_for(name)?;
        if images.is_empty() {
            return Err(GalleryError::NotEnrolled(name.to_string()));
        }
        for path in &images {
            remove_file(path)?;
        }
        tracing::info!(name, removed = images.len(), "identity removed");
        self.reload(embedder)?;
        Ok(())
    }

    fn images_for(&self, name: &str) -> Result<Vec<PathBuf>, GalleryError> {
        Ok(enrollment_images(&self.dir)?
            .into_iter()
            .filter(|p| p.file_stem().and_then(|s| s.to_str()) == Some(name))
            .collect())
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn names(&self) -> Vec<String> {
        self.identities.iter().map(|i| i.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn remove_file(path: &Path) -> Result<(), GalleryError> {
    std::fs::remove_file(path).map_err(|source| GalleryError::Remove {
        path: path.to_path_buf(),
        source,
    })
}
