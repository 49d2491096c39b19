use crate::engine::{EngineError, EngineHandle};
use chrono::NaiveDate;
use std::path::PathBuf;
use zbus::interface;

fn failed(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// D-Bus interface for the attendance scanner daemon.
///
/// Bus name: org.rollcall.Scanner1
/// Object path: /org/rollcall/Scanner1
pub struct ScannerService {
    engine: EngineHandle,
}

impl ScannerService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.rollcall.Scanner1")]
impl ScannerService {
    /// Begin scanning. Returns false if a scan was already running.
    async fn start(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start requested");
        self.engine.start().await.map_err(failed)
    }

    /// Stop scanning. Returns false if the scanner was idle.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        self.engine.stop().await.map_err(failed)
    }

    /// Scanner status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        to_json(&status)
    }

    /// Attendance rows for a date (`YYYY-MM-DD`, empty for today) as JSON.
    async fn report(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            None
        } else {
            Some(
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{date:?}: {e}")))?,
            )
        };
        let rows = self.engine.report(date).await.map_err(failed)?;
        to_json(&rows)
    }

    /// Dates with attendance records, ascending.
    async fn dates(&self) -> zbus::fdo::Result<Vec<String>> {
        let dates = self.engine.dates().await.map_err(failed)?;
        Ok(dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect())
    }

    /// Enroll `name` from an image file. Returns the stored image path.
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, image_path, "enroll requested");
        let stored = self
            .engine
            .enroll(name.to_string(), PathBuf::from(image_path))
            .await
            .map_err(failed)?;
        Ok(stored.display().to_string())
    }

    async fn remove(&self, name: &str) -> zbus::fdo::Result<()> {
        tracing::info!(name, "remove requested");
        self.engine.remove(name.to_string()).await.map_err(failed)
    }

    /// Enrolled identity names.
    async fn list_identities(&self) -> zbus::fdo::Result<Vec<String>> {
        self.engine.identities().await.map_err(failed)
    }

    /// Rebuild the gallery from disk. Returns the identity count.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        let count = self.engine.reload().await.map_err(failed)?;
        Ok(count as u32)
    }
}
