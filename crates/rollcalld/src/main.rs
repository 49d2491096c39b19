use anyhow::{Context, Result};
use rollcall_hw::{FrameSource, ImageDirSource, V4l2Source};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};

const BUS_NAME: &str = "org.rollcall.Scanner1";
const OBJECT_PATH: &str = "/org/rollcall/Scanner1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;

    let source: Box<dyn FrameSource> = if config.source_is_directory() {
        tracing::info!(dir = %config.source, "using image directory source");
        Box::new(ImageDirSource::new(&config.source))
    } else {
        tracing::info!(device = %config.source, "using V4L2 camera source");
        Box::new(V4l2Source::new(config.source.clone()))
    };

    let engine = engine::spawn_engine(&config, source).context("failed to start engine")?;
    let service = dbus_interface::ScannerService::new(engine.clone());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    if config.autostart {
        engine.start().await.context("autostart failed")?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    if let Err(e) = engine.stop().await {
        tracing::warn!(error = %e, "failed to stop scanning cleanly");
    }

    Ok(())
}
