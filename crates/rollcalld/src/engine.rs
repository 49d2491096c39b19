use crate::config::Config;
use chrono::NaiveDate;
use image::RgbImage;
use rollcall_core::{
    draw_annotations, AttendanceEvent, Annotation, DetectionModel, EmbeddingFn, FaceDetector,
    FaceRecognizer, GalleryStore, Ledger, MeanColorEmbedder, Scanner, YoloModel,
};
use rollcall_hw::{FrameSource, SourceError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::DetectorError),
    #[error("gallery error: {0}")]
    Gallery(#[from] rollcall_core::GalleryError),
    #[error("ledger error: {0}")]
    Ledger(#[from] rollcall_core::LedgerError),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("failed to load image: {0}")]
    Image(#[from] image::ImageError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Point-in-time view of the scan loop.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub scanning: bool,
    pub source: String,
    pub frames_processed: u64,
    pub frame_errors: u64,
    pub marks_today: usize,
    pub identities: usize,
    pub last_annotations: Vec<Annotation>,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Start(Reply<bool>),
    Stop(Reply<bool>),
    Status(Reply<EngineStatus>),
    Report {
        date: Option<NaiveDate>,
        reply: Reply<Vec<AttendanceEvent>>,
    },
    Dates(Reply<Vec<NaiveDate>>),
    Enroll {
        name: String,
        image_path: PathBuf,
        reply: Reply<PathBuf>,
    },
    Remove {
        name: String,
        reply: Reply<()>,
    },
    Identities(Reply<Vec<String>>),
    Reload(Reply<usize>),
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Open the frame source and begin scanning. Returns false if already scanning.
    pub async fn start(&self) -> Result<bool, EngineError> {
        self.request(EngineRequest::Start).await
    }

    /// Stop scanning and release the frame source. Returns false if idle.
    pub async fn stop(&self) -> Result<bool, EngineError> {
        self.request(EngineRequest::Stop).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(EngineRequest::Status).await
    }

    /// Attendance rows for `date` (today when `None`).
    pub async fn report(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceEvent>, EngineError> {
        self.request(|reply| EngineRequest::Report { date, reply }).await
    }

    pub async fn dates(&self) -> Result<Vec<NaiveDate>, EngineError> {
        self.request(EngineRequest::Dates).await
    }

    /// Enroll `name` from an image file readable by the daemon.
    pub async fn enroll(&self, name: String, image_path: PathBuf) -> Result<PathBuf, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            name,
            image_path,
            reply,
        })
        .await
    }

    pub async fn remove(&self, name: String) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Remove { name, reply })
            .await
    }

    pub async fn identities(&self) -> Result<Vec<String>, EngineError> {
        self.request(EngineRequest::Identities).await
    }

    /// Rebuild the gallery from disk. Returns the number of identities loaded.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        self.request(EngineRequest::Reload).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the YOLO model, prepares the gallery and attendance directories,
/// then enters the request loop. Fails fast at startup if any resource
/// is unavailable. The frame source is only opened when scanning starts.
pub fn spawn_engine(
    config: &Config,
    source: Box<dyn FrameSource>,
) -> Result<EngineHandle, EngineError> {
    let model = YoloModel::load(
        &config.model_path_str(),
        config.detection_confidence,
        config.nms_threshold,
    )?;
    spawn_engine_with_model(config, Box::new(model), source)
}

/// [`spawn_engine`] with an already-constructed detection model.
pub fn spawn_engine_with_model(
    config: &Config,
    model: Box<dyn DetectionModel>,
    source: Box<dyn FrameSource>,
) -> Result<EngineHandle, EngineError> {
    let embedder: Arc<dyn EmbeddingFn> = Arc::new(MeanColorEmbedder);

    let detector = FaceDetector::new(model, config.face_fraction)?;
    let recognizer = FaceRecognizer::new(embedder.clone(), config.recognition_threshold);
    let scanner = Scanner::new(detector, recognizer, config.min_face_size);

    rollcall_core::gallery::ensure_dir(&config.gallery_dir)?;
    let gallery = GalleryStore::load(&config.gallery_dir, embedder.as_ref())?;

    let ledger = Ledger::open(&config.attendance_dir)?;
    tracing::info!(dir = %config.attendance_dir.display(), "attendance ledger opened");

    let worker = Worker {
        scanner,
        gallery,
        ledger,
        embedder,
        source,
        scanning: false,
        read_failures: 0,
        frames_processed: 0,
        frame_errors: 0,
        last_annotations: Vec::new(),
        frame_interval: Duration::from_millis(config.frame_interval_ms),
        max_read_failures: config.max_read_failures,
        snapshot_path: config.snapshot_path.clone(),
    };

    let (tx, rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || worker.run(rx))
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

/// State owned by the engine thread.
struct Worker {
    scanner: Scanner,
    gallery: GalleryStore,
    ledger: Ledger,
    embedder: Arc<dyn EmbeddingFn>,
    source: Box<dyn FrameSource>,
    scanning: bool,
    read_failures: u32,
    frames_processed: u64,
    frame_errors: u64,
    last_annotations: Vec<Annotation>,
    frame_interval: Duration,
    max_read_failures: u32,
    snapshot_path: Option<PathBuf>,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");

        'outer: loop {
            if !self.scanning {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => break,
                }
                continue;
            }

            // Requests are only observed between frames.
            loop {
                match rx.try_recv() {
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            if self.scanning {
                self.scan_frame();
                std::thread::sleep(self.frame_interval);
            }
        }

        self.source.release();
        tracing::info!("engine thread exiting");
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Start(reply) => {
                let _ = reply.send(self.start());
            }
            EngineRequest::Stop(reply) => {
                let _ = reply.send(Ok(self.stop()));
            }
            EngineRequest::Status(reply) => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Report { date, reply } => {
                let _ = reply.send(self.ledger.report(date).map_err(Into::into));
            }
            EngineRequest::Dates(reply) => {
                let _ = reply.send(self.ledger.dates().map_err(Into::into));
            }
            EngineRequest::Enroll {
                name,
                image_path,
                reply,
            } => {
                let _ = reply.send(self.enroll(&name, &image_path));
            }
            EngineRequest::Remove { name, reply } => {
                let result = self.gallery.remove(&name, self.embedder.as_ref());
                let _ = reply.send(result.map_err(Into::into));
            }
            EngineRequest::Identities(reply) => {
                let _ = reply.send(Ok(self.gallery.names()));
            }
            EngineRequest::Reload(reply) => {
                let result = self.gallery.reload(self.embedder.as_ref());
                if let Ok(count) = &result {
                    tracing::info!(identities = count, "gallery reloaded");
                }
                let _ = reply.send(result.map_err(Into::into));
            }
        }
    }

    fn start(&mut self) -> Result<bool, EngineError> {
        if self.scanning {
            return Ok(false);
        }
        self.source.open()?;
        self.scanning = true;
        self.read_failures = 0;
        tracing::info!(source = %self.source.describe(), "scanning started");
        Ok(true)
    }

    fn stop(&mut self) -> bool {
        if !self.scanning {
            return false;
        }
        self.scanning = false;
        self.source.release();
        tracing::info!(
            frames = self.frames_processed,
            errors = self.frame_errors,
            "scanning stopped"
        );
        true
    }

    fn status(&mut self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            scanning: self.scanning,
            source: self.source.describe(),
            frames_processed: self.frames_processed,
            frame_errors: self.frame_errors,
            marks_today: self.ledger.count_today()?,
            identities: self.gallery.len(),
            last_annotations: self.last_annotations.clone(),
        })
    }

    fn enroll(&mut self, name: &str, image_path: &Path) -> Result<PathBuf, EngineError> {
        let image = image::open(image_path)?.to_rgb8();
        Ok(self.gallery.enroll(name, &image, self.embedder.as_ref())?)
    }

    /// Read and process one frame. Per-frame failures are logged and counted.
    fn scan_frame(&mut self) {
        let frame = match self.source.read() {
            Ok(frame) => {
                self.read_failures = 0;
                frame
            }
            Err(e) => {
                self.frame_errors += 1;
                self.read_failures += 1;
                tracing::warn!(error = %e, consecutive = self.read_failures, "frame read failed");
                if self.read_failures > self.max_read_failures {
                    tracing::warn!(
                        limit = self.max_read_failures,
                        "too many consecutive read failures; stopping scan"
                    );
                    self.stop();
                }
                return;
            }
        };

        match self.scanner.process(&frame.image, &self.gallery, &mut self.ledger) {
            Ok(annotations) => {
                self.frames_processed += 1;
                tracing::debug!(
                    seq = frame.sequence,
                    faces = annotations.len(),
                    "frame processed"
                );
                if let Some(path) = &self.snapshot_path {
                    if let Err(e) = write_snapshot(path, frame.image, &annotations) {
                        tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot");
                    }
                }
                self.last_annotations = annotations;
            }
            Err(e) => {
                self.frame_errors += 1;
                tracing::warn!(seq = frame.sequence, error = %e, "frame processing failed");
            }
        }
    }
}

/// Write the annotated frame next to `path`, then rename over it.
fn write_snapshot(
    path: &Path,
    mut image: RgbImage,
    annotations: &[Annotation],
) -> Result<(), image::ImageError> {
    draw_annotations(&mut image, annotations);
    let format = image::ImageFormat::from_path(path)?;
    let tmp = path.with_extension("tmp");
    image.save_with_format(&tmp, format)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rollcall_core::{BoundingBox, Detection, DetectorError};
    use rollcall_hw::Frame;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    const ALICE: Rgb<u8> = Rgb([200, 60, 60]);

    struct OnePerson;

    impl DetectionModel for OnePerson {
        fn name(&self) -> &'static str {
            "one-person"
        }

        fn infer(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(vec![Detection {
                bbox: BoundingBox::new(10, 10, 110, 210),
                class_id: 0,
                confidence: 0.9,
            }])
        }
    }

    /// Fails inference on every `every`-th frame.
    struct FlakyModel {
        calls: u32,
        every: u32,
    }

    impl DetectionModel for FlakyModel {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            self.calls += 1;
            if self.calls % self.every == 0 {
                return Err(DetectorError::InferenceFailed("flaky frame".into()));
            }
            OnePerson.infer(frame)
        }
    }

    /// Solid-color frames; fails every read when `failing` is set.
    struct StubSource {
        color: Rgb<u8>,
        failing: bool,
        open: Arc<AtomicBool>,
        sequence: u32,
    }

    impl StubSource {
        fn new(color: Rgb<u8>, failing: bool) -> (Self, Arc<AtomicBool>) {
            let open = Arc::new(AtomicBool::new(false));
            let source = Self {
                color,
                failing,
                open: open.clone(),
                sequence: 0,
            };
            (source, open)
        }
    }

    impl FrameSource for StubSource {
        fn describe(&self) -> String {
            "stub".into()
        }

        fn open(&mut self) -> Result<(), SourceError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self) -> Result<Frame, SourceError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(SourceError::NotOpen);
            }
            if self.failing {
                return Err(SourceError::Read("stub failure".into()));
            }
            self.sequence += 1;
            Ok(Frame {
                image: RgbImage::from_pixel(160, 240, self.color),
                timestamp: Instant::now(),
                sequence: self.sequence,
            })
        }

        fn release(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn test_config(root: &Path) -> Config {
        let mut config = Config::with_dirs(root, root);
        config.frame_interval_ms = 1;
        config.max_read_failures = 3;
        config
    }

    fn enroll_alice(config: &Config) {
        std::fs::create_dir_all(&config.gallery_dir).unwrap();
        RgbImage::from_pixel(8, 8, ALICE)
            .save(config.gallery_dir.join("alice.png"))
            .unwrap();
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_spawn_engine_missing_model() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (source, _) = StubSource::new(ALICE, false);
        assert!(matches!(
            spawn_engine(&config, Box::new(source)),
            Err(EngineError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }

    #[test]
    fn test_spawn_engine_rejects_bad_fraction() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.face_fraction = 0.0;
        let (source, _) = StubSource::new(ALICE, false);
        assert!(spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).is_err());
    }

    #[tokio::test]
    async fn test_scan_marks_once_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        enroll_alice(&config);
        let (source, open) = StubSource::new(ALICE, false);
        let engine = spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).unwrap();

        assert_eq!(engine.identities().await.unwrap(), vec!["alice".to_string()]);
        assert!(engine.start().await.unwrap());
        assert!(!engine.start().await.unwrap());
        assert!(open.load(Ordering::SeqCst));

        for _ in 0..500 {
            if engine.status().await.unwrap().frames_processed >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = engine.status().await.unwrap();
        assert!(status.scanning);
        assert!(status.frames_processed >= 3);
        assert_eq!(status.marks_today, 1);
        assert_eq!(status.last_annotations.len(), 1);
        assert_eq!(status.last_annotations[0].name, "alice");

        assert!(engine.stop().await.unwrap());
        assert!(!engine.stop().await.unwrap());
        assert!(!open.load(Ordering::SeqCst));

        let report = engine.report(None).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].name, "alice");
        assert_eq!(engine.dates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detection_failures_do_not_stop_scanning() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        enroll_alice(&config);
        let (source, open) = StubSource::new(ALICE, false);
        let model = FlakyModel { calls: 0, every: 2 };
        let engine = spawn_engine_with_model(&config, Box::new(model), Box::new(source)).unwrap();

        assert!(engine.start().await.unwrap());
        for _ in 0..500 {
            let status = engine.status().await.unwrap();
            if status.frames_processed >= 4 && status.frame_errors >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = engine.status().await.unwrap();
        assert!(status.scanning);
        assert!(open.load(Ordering::SeqCst));
        assert!(status.frame_errors >= 4);
        assert!(status.frames_processed >= 4);
        assert_eq!(status.marks_today, 1);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_failures_stop_scanning() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (source, open) = StubSource::new(ALICE, true);
        let engine = spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).unwrap();

        assert!(engine.start().await.unwrap());
        for _ in 0..500 {
            if !engine.status().await.unwrap().scanning {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = engine.status().await.unwrap();
        assert!(!status.scanning);
        assert_eq!(status.frame_errors, 4);
        assert_eq!(status.frames_processed, 0);
        assert!(!open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_read_failure_limit_stops_on_first() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.max_read_failures = 0;
        let (source, open) = StubSource::new(ALICE, true);
        let engine = spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).unwrap();

        assert!(engine.start().await.unwrap());
        for _ in 0..500 {
            if !engine.status().await.unwrap().scanning {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = engine.status().await.unwrap();
        assert!(!status.scanning);
        assert_eq!(status.frame_errors, 1);
        assert!(!open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enroll_remove_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (source, _) = StubSource::new(ALICE, false);
        let engine = spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).unwrap();

        let image_path = tmp.path().join("capture.jpg");
        RgbImage::from_pixel(16, 16, ALICE).save(&image_path).unwrap();

        let stored = engine.enroll("bob".into(), image_path).await.unwrap();
        assert_eq!(stored, config.gallery_dir.join("bob.png"));
        assert_eq!(engine.identities().await.unwrap(), vec!["bob".to_string()]);

        assert!(engine
            .enroll("bob".into(), tmp.path().join("missing.jpg"))
            .await
            .is_err());
        assert!(engine
            .enroll("../evil".into(), tmp.path().join("capture.jpg"))
            .await
            .is_err());

        engine.remove("bob".into()).await.unwrap();
        assert!(engine.identities().await.unwrap().is_empty());
        assert!(engine.remove("bob".into()).await.is_err());

        enroll_alice(&config);
        assert_eq!(engine.reload().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_written() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        let snapshot = tmp.path().join("frame.png");
        config.snapshot_path = Some(snapshot.clone());
        let (source, _) = StubSource::new(Rgb([10, 10, 200]), false);
        let engine = spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).unwrap();

        engine.start().await.unwrap();
        wait_for(|| snapshot.exists()).await;
        engine.stop().await.unwrap();

        let written = image::open(&snapshot).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (160, 240));
        // Unrecognized person outlined in red
        assert_eq!(written.get_pixel(10, 10), &Rgb([255, 0, 0]));
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_source() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (source, open) = StubSource::new(ALICE, false);
        let engine = spawn_engine_with_model(&config, Box::new(OnePerson), Box::new(source)).unwrap();

        engine.start().await.unwrap();
        assert!(open.load(Ordering::SeqCst));
        drop(engine);
        wait_for(|| !open.load(Ordering::SeqCst)).await;
    }
}
