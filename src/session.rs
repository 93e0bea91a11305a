use crate::api::RemoteApi;
use crate::artifact::ArtifactRef;
use crate::config::{CaptureConfig, UploadConfig};
use crate::error::SyncError;
use crate::sync::{RemoteTripRef, StepError, SyncPipeline, SyncRequest, SyncStep};
use crate::track::{LocationSample, TrackRecorder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// The video capture collaborator. Only its finished output file is
/// consumed; encoding is outside this crate.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn start(&self) -> Result<(), SyncError>;

    /// Stop capture and return the finished artifact file.
    async fn stop(&self) -> Result<PathBuf, SyncError>;
}

/// The location feed collaborator: pushes fixes into the handed-over
/// track recorder until stopped.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn start(&self, sink: TrackRecorder) -> Result<(), SyncError>;
    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Stopping,
    Syncing,
    Completed,
    Failed,
}

/// What went wrong, and at which saga step if the failure happened while
/// syncing.
#[derive(Debug, Clone, Error)]
#[error("{summary}")]
pub struct ErrorInfo {
    pub step: Option<SyncStep>,
    pub summary: String,
}

impl From<SyncError> for ErrorInfo {
    fn from(err: SyncError) -> Self {
        ErrorInfo { step: None, summary: err.to_string() }
    }
}

impl From<StepError> for ErrorInfo {
    fn from(err: StepError) -> Self {
        ErrorInfo { step: Some(err.step), summary: err.to_string() }
    }
}

/// The single active recording session. All fields are owned by the
/// controller and mutated only through its transition methods.
struct RecordingSession {
    id: Option<Uuid>,
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    started_mono: Option<Instant>,
    stopped_at: Option<DateTime<Utc>>,
    recorded: Option<Duration>,
    artifact: Option<ArtifactRef>,
    samples: Vec<LocationSample>,
    remote: Option<RemoteTripRef>,
    last_error: Option<ErrorInfo>,
}

impl RecordingSession {
    fn idle() -> Self {
        RecordingSession {
            id: None,
            state: SessionState::Idle,
            started_at: None,
            started_mono: None,
            stopped_at: None,
            recorded: None,
            artifact: None,
            samples: Vec::new(),
            remote: None,
            last_error: None,
        }
    }
}

/// Read-side snapshot for a presentation layer. Elapsed time is
/// recomputed from a monotonic instant on every call, never stored as
/// mutable state.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: Option<Uuid>,
    pub state: SessionState,
    pub elapsed: Option<Duration>,
    pub sample_count: usize,
    pub remote: Option<RemoteTripRef>,
    pub last_error: Option<ErrorInfo>,
}

/// Owns the recording session lifecycle:
/// `Idle → Recording → Stopping → Syncing → Completed`, with `Failed`
/// reachable from `Recording`, `Stopping`, and `Syncing`.
///
/// The session is a single-writer resource: transitions funnel through
/// these methods and a second transition attempted mid-flight fails its
/// state check instead of interleaving.
pub struct SessionController {
    capture: Arc<dyn CaptureSource>,
    location: Arc<dyn LocationSource>,
    api: Arc<dyn RemoteApi>,
    upload_config: UploadConfig,
    capture_config: CaptureConfig,
    device_id: String,
    track: TrackRecorder,
    session: Mutex<RecordingSession>,
}

impl SessionController {
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        location: Arc<dyn LocationSource>,
        api: Arc<dyn RemoteApi>,
        upload_config: UploadConfig,
        capture_config: CaptureConfig,
        device_id: String,
    ) -> Self {
        SessionController {
            capture,
            location,
            api,
            upload_config,
            capture_config,
            device_id,
            track: TrackRecorder::new(),
            session: Mutex::new(RecordingSession::idle()),
        }
    }

    /// Begin a recording session. Valid only from `Idle`.
    pub async fn start(&self) -> Result<Uuid, ErrorInfo> {
        let mut session = self.session.lock().await;
        if session.state != SessionState::Idle {
            return Err(SyncError::Precondition(format!(
                "cannot start: session is {:?}",
                session.state
            ))
            .into());
        }
        if self.device_id.is_empty() {
            return Err(SyncError::Precondition("device is not registered".into()).into());
        }

        let id = Uuid::new_v4();
        self.track.start();
        if let Err(e) = self.location.start(self.track.clone()).await {
            session.state = SessionState::Failed;
            session.last_error = Some(ErrorInfo::from(e.clone()));
            return Err(e.into());
        }
        if let Err(e) = self.capture.start().await {
            self.location.stop().await;
            self.track.stop();
            session.state = SessionState::Failed;
            session.last_error = Some(ErrorInfo::from(e.clone()));
            return Err(e.into());
        }

        session.id = Some(id);
        session.started_at = Some(Utc::now());
        session.started_mono = Some(Instant::now());
        session.state = SessionState::Recording;
        tracing::info!(session_id = %id, "recording started");
        Ok(id)
    }

    /// Stop recording and persist the trip remotely. Valid only from
    /// `Recording`. The saga runs to completion or to its first failure;
    /// there is no mid-saga cancellation.
    pub async fn stop(&self) -> Result<RemoteTripRef, ErrorInfo> {
        let (started_at, started_mono) = {
            let mut session = self.session.lock().await;
            if session.state != SessionState::Recording {
                return Err(SyncError::Precondition(format!(
                    "cannot stop: session is {:?}",
                    session.state
                ))
                .into());
            }
            session.state = SessionState::Stopping;
            (
                session.started_at.expect("recording session has start time"),
                session.started_mono.expect("recording session has start instant"),
            )
        };

        let artifact_path = match self.capture.stop().await {
            Ok(path) => path,
            Err(e) => {
                self.location.stop().await;
                self.track.stop();
                return Err(self.fail(e.into()).await);
            }
        };
        self.location.stop().await;
        let samples = self.track.stop();
        let stopped_at = Utc::now();
        let recorded = started_mono.elapsed();

        let (artifact, data) = match ArtifactRef::from_file(&artifact_path).await {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        {
            let mut session = self.session.lock().await;
            session.state = SessionState::Syncing;
            session.stopped_at = Some(stopped_at);
            session.recorded = Some(recorded);
            session.artifact = Some(artifact.clone());
            session.samples = samples.clone();
        }
        tracing::info!(
            bytes = artifact.byte_length,
            samples = samples.len(),
            duration_s = recorded.as_secs(),
            "capture stopped, syncing trip"
        );

        let pipeline = SyncPipeline::new(&*self.api, &self.upload_config, &self.capture_config);
        let result = pipeline
            .run(SyncRequest {
                device_id: &self.device_id,
                started_at,
                stopped_at,
                duration_s: recorded.as_secs(),
                artifact: &artifact,
                data: &data,
                samples: &samples,
            })
            .await;

        let mut session = self.session.lock().await;
        match result {
            Ok(remote) => {
                session.remote = Some(remote.clone());
                session.state = SessionState::Completed;
                tracing::info!(trip_id = %remote.trip_id, "session completed");
                Ok(remote)
            }
            Err(e) => {
                let info = ErrorInfo::from(e);
                session.last_error = Some(info.clone());
                session.state = SessionState::Failed;
                tracing::error!("session failed: {info}");
                Err(info)
            }
        }
    }

    /// Acknowledge a terminal session and return to `Idle` for the next
    /// recording.
    pub async fn reset(&self) -> Result<(), ErrorInfo> {
        let mut session = self.session.lock().await;
        match session.state {
            SessionState::Completed | SessionState::Failed => {
                *session = RecordingSession::idle();
                Ok(())
            }
            state => Err(SyncError::Precondition(format!(
                "cannot reset: session is {state:?}"
            ))
            .into()),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let session = self.session.lock().await;
        let elapsed = match session.state {
            SessionState::Recording | SessionState::Stopping | SessionState::Syncing => {
                session.started_mono.map(|m| m.elapsed())
            }
            _ => session.recorded,
        };
        let sample_count = match session.state {
            SessionState::Recording | SessionState::Stopping => self.track.len(),
            _ => session.samples.len(),
        };
        SessionStatus {
            id: session.id,
            state: session.state,
            elapsed,
            sample_count,
            remote: session.remote.clone(),
            last_error: session.last_error.clone(),
        }
    }

    async fn fail(&self, info: ErrorInfo) -> ErrorInfo {
        let mut session = self.session.lock().await;
        session.last_error = Some(info.clone());
        session.state = SessionState::Failed;
        tracing::error!("session failed: {info}");
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeRemote;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Capture stub that writes a fixed payload on stop.
    struct ScriptedCapture {
        dir: TempDir,
        payload: Vec<u8>,
        fail_start: bool,
        fail_stop: bool,
    }

    impl ScriptedCapture {
        fn with_payload(payload: Vec<u8>) -> Self {
            ScriptedCapture {
                dir: TempDir::new().unwrap(),
                payload,
                fail_start: false,
                fail_stop: false,
            }
        }
    }

    #[async_trait]
    impl CaptureSource for ScriptedCapture {
        async fn start(&self) -> Result<(), SyncError> {
            if self.fail_start {
                return Err(SyncError::Precondition("camera permission denied".into()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<PathBuf, SyncError> {
            if self.fail_stop {
                return Err(SyncError::Transport("encoder crashed".into()));
            }
            let path = self.dir.path().join("segment.mp4");
            tokio::fs::write(&path, &self.payload)
                .await
                .map_err(|e| SyncError::Validation(e.to_string()))?;
            Ok(path)
        }
    }

    /// Location stub that keeps the sink so tests can push fixes
    /// mid-recording.
    #[derive(Default)]
    struct ScriptedLocation {
        sink: StdMutex<Option<TrackRecorder>>,
    }

    impl ScriptedLocation {
        fn push_fixes(&self, n: usize) {
            let sink = self.sink.lock().unwrap();
            let sink = sink.as_ref().expect("location source started");
            for i in 0..n {
                sink.push(LocationSample {
                    captured_at: Utc::now(),
                    latitude: 47.6 + i as f64 * 0.0001,
                    longitude: -122.3,
                    altitude: Some(30.0),
                    speed: Some(7.5),
                    bearing: Some(180.0),
                    accuracy: Some(5.0),
                });
            }
        }
    }

    #[async_trait]
    impl LocationSource for ScriptedLocation {
        async fn start(&self, sink: TrackRecorder) -> Result<(), SyncError> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn stop(&self) {
            self.sink.lock().unwrap().take();
        }
    }

    fn controller(
        capture: ScriptedCapture,
        remote: Arc<FakeRemote>,
    ) -> (SessionController, Arc<ScriptedLocation>) {
        let location = Arc::new(ScriptedLocation::default());
        let ctl = SessionController::new(
            Arc::new(capture),
            location.clone(),
            remote,
            UploadConfig { chunk_size: 1024, max_retries: 2, retry_backoff_ms: 1 },
            CaptureConfig {
                video_codec: "h264".into(),
                width: 1920,
                height: 1080,
                fps: 30.0,
                filename: "segment.mp4".into(),
            },
            "device-1".into(),
        );
        (ctl, location)
    }

    #[tokio::test]
    async fn test_full_lifecycle_reaches_completed() {
        let remote = Arc::new(FakeRemote::new());
        let payload = vec![8u8; 2500];
        let (ctl, location) = controller(ScriptedCapture::with_payload(payload.clone()), remote.clone());

        assert_eq!(ctl.status().await.state, SessionState::Idle);
        ctl.start().await.unwrap();
        assert_eq!(ctl.status().await.state, SessionState::Recording);

        location.push_fixes(4);
        assert_eq!(ctl.status().await.sample_count, 4);

        let trip = ctl.stop().await.unwrap();
        assert!(!trip.trip_id.is_empty());

        let status = ctl.status().await;
        assert_eq!(status.state, SessionState::Completed);
        assert_eq!(status.sample_count, 4);
        assert!(status.last_error.is_none());
        assert_eq!(status.remote.unwrap().trip_id, trip.trip_id);

        let state = remote.state.lock().unwrap();
        assert_eq!(state.uploads.values().next().unwrap().received, payload);
        assert_eq!(state.metadata[0].2.lines().count(), 4);
        assert_eq!(state.completed_trips.len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let remote = Arc::new(FakeRemote::new());
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![1u8; 10]), remote);

        ctl.start().await.unwrap();
        let err = ctl.start().await.unwrap_err();
        assert!(err.summary.contains("precondition"));
        assert_eq!(ctl.status().await.state, SessionState::Recording);
    }

    #[tokio::test]
    async fn test_stop_from_idle_rejected() {
        let remote = Arc::new(FakeRemote::new());
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![1u8; 10]), remote);

        let err = ctl.stop().await.unwrap_err();
        assert!(err.summary.contains("cannot stop"));
        assert_eq!(ctl.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_capture_start_failure_fails_session() {
        let remote = Arc::new(FakeRemote::new());
        let mut capture = ScriptedCapture::with_payload(vec![1u8; 10]);
        capture.fail_start = true;
        let (ctl, _location) = controller(capture, remote);

        let err = ctl.start().await.unwrap_err();
        assert!(err.summary.contains("camera permission"));
        let status = ctl.status().await;
        assert_eq!(status.state, SessionState::Failed);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_capture_stop_failure_fails_session() {
        let remote = Arc::new(FakeRemote::new());
        let mut capture = ScriptedCapture::with_payload(vec![1u8; 10]);
        capture.fail_stop = true;
        let (ctl, _location) = controller(capture, remote.clone());

        ctl.start().await.unwrap();
        let err = ctl.stop().await.unwrap_err();
        assert!(err.summary.contains("encoder crashed"));
        assert_eq!(ctl.status().await.state, SessionState::Failed);
        // Nothing was created remotely.
        assert!(remote.state.lock().unwrap().trips.is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_artifact_fails_before_any_remote_call() {
        let remote = Arc::new(FakeRemote::new());
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![]), remote.clone());

        ctl.start().await.unwrap();
        let err = ctl.stop().await.unwrap_err();
        assert!(err.summary.contains("zero-length"));
        assert!(err.step.is_none());
        assert_eq!(ctl.status().await.state, SessionState::Failed);
        assert!(remote.state.lock().unwrap().trips.is_empty());
    }

    #[tokio::test]
    async fn test_saga_failure_records_step_and_resets() {
        let remote = Arc::new(FakeRemote::new());
        remote.state.lock().unwrap().ack_override = Some(3);
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![6u8; 500]), remote.clone());

        ctl.start().await.unwrap();
        let err = ctl.stop().await.unwrap_err();
        assert_eq!(err.step, Some(SyncStep::UploadArtifact));

        let status = ctl.status().await;
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.last_error.unwrap().step.unwrap().index(), 3);

        // Terminal state acknowledged, session eligible for a fresh start.
        ctl.reset().await.unwrap();
        assert_eq!(ctl.status().await.state, SessionState::Idle);
        ctl.start().await.unwrap();
        assert_eq!(ctl.status().await.state, SessionState::Recording);
    }

    #[tokio::test]
    async fn test_reset_rejected_while_recording() {
        let remote = Arc::new(FakeRemote::new());
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![1u8; 10]), remote);

        ctl.start().await.unwrap();
        assert!(ctl.reset().await.is_err());
    }

    #[tokio::test]
    async fn test_zero_samples_still_completes() {
        let remote = Arc::new(FakeRemote::new());
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![2u8; 300]), remote.clone());

        ctl.start().await.unwrap();
        ctl.stop().await.unwrap();

        assert_eq!(ctl.status().await.state, SessionState::Completed);
        let state = remote.state.lock().unwrap();
        assert_eq!(state.metadata[0].2, "");
        assert_eq!(state.completed_trips.len(), 1);
    }

    #[tokio::test]
    async fn test_elapsed_reported_while_recording() {
        let remote = Arc::new(FakeRemote::new());
        let (ctl, _location) = controller(ScriptedCapture::with_payload(vec![1u8; 10]), remote);

        assert!(ctl.status().await.elapsed.is_none());
        ctl.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = ctl.status().await.elapsed.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = ctl.status().await.elapsed.unwrap();
        assert!(second >= first);
        assert!(first >= Duration::from_millis(20));
    }
}
