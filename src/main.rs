use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

mod api;
mod artifact;
mod config;
mod error;
mod session;
mod sync;
mod track;
mod upload;

use api::{ApiClient, DeviceRegister};
use config::AppConfig;
use error::SyncError;
use session::{CaptureSource, LocationSource, SessionController};
use track::{LocationSample, TrackRecorder};

/// Records a simulated trip and uploads it to a trip server.
#[derive(Debug, Parser)]
#[command(name = "trip-recorder")]
struct Args {
    /// Path to a TOML config file (compiled-in defaults otherwise).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the server base URL from the config.
    #[arg(long)]
    server: Option<String>,

    #[arg(long, default_value = "rider@example.com")]
    email: String,

    #[arg(long, default_value = "changeme")]
    password: String,

    /// How long the simulated recording runs.
    #[arg(long, default_value_t = 10)]
    record_secs: u64,

    /// Size of the simulated video artifact.
    #[arg(long, default_value_t = 12_000_000)]
    artifact_bytes: usize,
}

/// Stand-in for the camera collaborator: produces a file of random bytes
/// when stopped, the same way the pipeline would receive a finished
/// encoder output.
struct SimulatedDashcam {
    output: PathBuf,
    artifact_bytes: usize,
}

#[async_trait]
impl CaptureSource for SimulatedDashcam {
    async fn start(&self) -> Result<(), SyncError> {
        info!("simulated capture started");
        Ok(())
    }

    async fn stop(&self) -> Result<PathBuf, SyncError> {
        let mut data = vec![0u8; self.artifact_bytes];
        fastrand::fill(&mut data);
        tokio::fs::write(&self.output, &data)
            .await
            .map_err(|e| SyncError::Validation(format!("cannot write artifact: {e}")))?;
        info!(bytes = data.len(), path = %self.output.display(), "simulated capture finished");
        Ok(self.output.clone())
    }
}

/// Stand-in for the GPS feed: pushes a drifting fix once per second.
#[derive(Default)]
struct SimulatedGps {
    feed: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl LocationSource for SimulatedGps {
    async fn start(&self, sink: TrackRecorder) -> Result<(), SyncError> {
        let handle = tokio::spawn(async move {
            let mut lat = 47.6062;
            let mut lon = -122.3321;
            loop {
                lat += (fastrand::f64() - 0.5) * 0.0004;
                lon += (fastrand::f64() - 0.5) * 0.0004;
                sink.push(LocationSample {
                    captured_at: Utc::now(),
                    latitude: lat,
                    longitude: lon,
                    altitude: Some(20.0 + fastrand::f64() * 5.0),
                    speed: Some(6.0 + fastrand::f64() * 2.0),
                    bearing: Some(fastrand::f64() * 360.0),
                    accuracy: Some(3.0 + fastrand::f64() * 4.0),
                });
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        *self.feed.lock().expect("gps feed lock") = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.feed.lock().expect("gps feed lock").take() {
            handle.abort();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    info!("starting trip-recorder");

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };
    if let Some(server) = args.server {
        cfg.api.base_url = server;
    }

    let (client, user) = ApiClient::login(
        &cfg.api.base_url,
        &args.email,
        &args.password,
        cfg.api.request_timeout(),
    )
    .await
    .context("login failed")?;
    info!(user_id = %user.id, "logged in");

    let device = client
        .register_device(&DeviceRegister {
            platform: std::env::consts::OS.to_string(),
            model: "simulated-dashcam".into(),
            os_version: "n/a".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        })
        .await
        .context("device registration failed")?;
    info!(device_id = %device.id, platform = %device.platform, "device registered");

    let output = std::env::temp_dir().join(format!("trip-{}.mp4", uuid::Uuid::new_v4()));
    let controller = SessionController::new(
        Arc::new(SimulatedDashcam {
            output: output.clone(),
            artifact_bytes: args.artifact_bytes,
        }),
        Arc::new(SimulatedGps::default()),
        Arc::new(client),
        cfg.upload.clone(),
        cfg.capture.clone(),
        device.id,
    );

    controller.start().await?;
    for _ in 0..args.record_secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = controller.status().await;
        info!(
            elapsed_s = status.elapsed.map(|e| e.as_secs()).unwrap_or(0),
            samples = status.sample_count,
            "recording"
        );
    }

    let trip = controller.stop().await?;
    info!(
        trip_id = %trip.trip_id,
        segment_id = %trip.segment_id,
        "trip uploaded and finalized"
    );

    cleanup_artifact(&output).await;
    Ok(())
}

async fn cleanup_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!("leaving artifact in place: {e}");
    }
}
