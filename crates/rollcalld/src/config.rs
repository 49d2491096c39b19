use rollcall_core::detector::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_FACE_FRACTION, DEFAULT_NMS_THRESHOLD,
};
use rollcall_core::recognizer::DEFAULT_RECOGNITION_THRESHOLD;
use rollcall_core::scanner::DEFAULT_MIN_FACE_SIZE;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MODEL_FILE: &str = "yolov8n.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path, or a directory of images to replay.
    pub source: String,
    /// YOLOv8 ONNX export.
    pub model_path: PathBuf,
    /// Enrollment images, one per identity.
    pub gallery_dir: PathBuf,
    /// Daily attendance CSV files.
    pub attendance_dir: PathBuf,
    /// Upper fraction of a person box taken as the face region.
    pub face_fraction: f32,
    /// Maximum embedding distance accepted as a match.
    pub recognition_threshold: f32,
    pub detection_confidence: f32,
    pub nms_threshold: f32,
    /// Face regions smaller than this (either side, pixels) are skipped.
    pub min_face_size: u32,
    /// Pause between frames while scanning.
    pub frame_interval_ms: u64,
    /// Consecutive frame read failures tolerated before scanning stops and
    /// the source is released; 0 stops on the first failure. Detection and
    /// recognition failures never count toward this limit.
    pub max_read_failures: u32,
    /// Where to write the latest annotated frame, if anywhere.
    pub snapshot_path: Option<PathBuf>,
    pub bus: BusKind,
    /// Start scanning as soon as the daemon is up.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));
        Self::with_dirs(&data_dir, &model_dir)
    }
}

impl Config {
    /// Defaults rooted at explicit data and model directories.
    pub fn with_dirs(data_dir: &Path, model_dir: &Path) -> Self {
        Self {
            source: "/dev/video0".to_string(),
            model_path: model_dir.join(MODEL_FILE),
            gallery_dir: data_dir.join("known"),
            attendance_dir: data_dir.join("attendance_records"),
            face_fraction: DEFAULT_FACE_FRACTION,
            recognition_threshold: DEFAULT_RECOGNITION_THRESHOLD,
            detection_confidence: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            frame_interval_ms: 30,
            max_read_failures: 30,
            snapshot_path: None,
            bus: BusKind::Session,
            autostart: false,
        }
    }

    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = config_file();
        let mut config = match &file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::debug!(file = ?file, config = ?config, "configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ROLLCALL_*` overrides. Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_SOURCE") {
            self.source = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_ATTENDANCE_DIR") {
            self.attendance_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SNAPSHOT_PATH") {
            self.snapshot_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        override_parsed(&lookup, "ROLLCALL_FACE_FRACTION", &mut self.face_fraction);
        override_parsed(&lookup, "ROLLCALL_RECOGNITION_THRESHOLD", &mut self.recognition_threshold);
        override_parsed(&lookup, "ROLLCALL_DETECTION_CONFIDENCE", &mut self.detection_confidence);
        override_parsed(&lookup, "ROLLCALL_NMS_THRESHOLD", &mut self.nms_threshold);
        override_parsed(&lookup, "ROLLCALL_MIN_FACE_SIZE", &mut self.min_face_size);
        override_parsed(&lookup, "ROLLCALL_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        override_parsed(&lookup, "ROLLCALL_MAX_READ_FAILURES", &mut self.max_read_failures);
        override_parsed(&lookup, "ROLLCALL_BUS", &mut self.bus);
        if let Some(v) = lookup("ROLLCALL_AUTOSTART") {
            self.autostart = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.face_fraction > 0.0 && self.face_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "face_fraction",
                reason: format!("must be in (0, 1], got {}", self.face_fraction),
            });
        }
        if !(self.recognition_threshold >= 0.0) {
            return Err(ConfigError::Invalid {
                key: "recognition_threshold",
                reason: format!("must be non-negative, got {}", self.recognition_threshold),
            });
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(ConfigError::Invalid {
                key: "detection_confidence",
                reason: format!("must be in [0, 1], got {}", self.detection_confidence),
            });
        }
        if self.source.is_empty() {
            return Err(ConfigError::Invalid {
                key: "source",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// True when the source names a directory of images rather than a device.
    pub fn source_is_directory(&self) -> bool {
        Path::new(&self.source).is_dir()
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    let path = config_home.join("rollcall").join("config.toml");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> Config {
        Config::with_dirs(Path::new("/data/rollcall"), Path::new("/models"))
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.source, "/dev/video0");
        assert_eq!(config.model_path, PathBuf::from("/models/yolov8n.onnx"));
        assert_eq!(config.gallery_dir, PathBuf::from("/data/rollcall/known"));
        assert_eq!(
            config.attendance_dir,
            PathBuf::from("/data/rollcall/attendance_records")
        );
        assert!((config.face_fraction - 0.4).abs() < 1e-6);
        assert!((config.recognition_threshold - 50.0).abs() < 1e-6);
        assert_eq!(config.min_face_size, 20);
        assert_eq!(config.frame_interval_ms, 30);
        assert_eq!(config.bus, BusKind::Session);
        assert!(!config.autostart);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "source = \"/srv/frames\"\nrecognition_threshold = 35.5\nbus = \"system\"\nautostart = true\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.source, "/srv/frames");
        assert!((config.recognition_threshold - 35.5).abs() < 1e-6);
        assert_eq!(config.bus, BusKind::System);
        assert!(config.autostart);
        // Untouched keys keep their defaults
        assert_eq!(config.min_face_size, 20);
    }

    #[test]
    fn test_from_file_rejects_unknown_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "camera_device = \"/dev/video2\"\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/rollcall.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_SOURCE", "/dev/video4"),
            ("ROLLCALL_FACE_FRACTION", "0.5"),
            ("ROLLCALL_MIN_FACE_SIZE", "not-a-number"),
            ("ROLLCALL_SNAPSHOT_PATH", "/run/rollcall/frame.png"),
            ("ROLLCALL_BUS", "system"),
            ("ROLLCALL_AUTOSTART", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = base();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.source, "/dev/video4");
        assert!((config.face_fraction - 0.5).abs() < 1e-6);
        assert_eq!(config.min_face_size, 20);
        assert_eq!(
            config.snapshot_path,
            Some(PathBuf::from("/run/rollcall/frame.png"))
        );
        assert_eq!(config.bus, BusKind::System);
        assert!(config.autostart);
    }

    #[test]
    fn test_autostart_false_values() {
        let mut config = base();
        config.autostart = true;
        config.apply_overrides(|k| (k == "ROLLCALL_AUTOSTART").then(|| "false".to_string()));
        assert!(!config.autostart);
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = base();
        config.face_fraction = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "face_fraction", .. })
        ));
        config.face_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_threshold() {
        let mut config = base();
        config.recognition_threshold = -1.0;
        assert!(config.validate().is_err());
    }
}
