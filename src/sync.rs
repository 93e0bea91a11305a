use crate::api::{
    RemoteApi, SegmentComplete, SegmentCreate, SegmentMetadata, TripComplete, TripCreate,
    UploadCreate, FILE_TYPE_GPS_JSONL, FILE_TYPE_VIDEO_MP4, STATUS_COMPLETE,
};
use crate::artifact::ArtifactRef;
use crate::config::{CaptureConfig, UploadConfig};
use crate::error::SyncError;
use crate::track::{self, LocationSample};
use crate::upload::{ChunkUpload, UploadProgress, Uploader};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The ordered remote operations that persist one finished recording.
/// Each step depends on an identifier produced by the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    CreateTrip,
    CreateSegment,
    UploadArtifact,
    CompleteSegment,
    AttachTrack,
    CompleteTrip,
}

impl SyncStep {
    pub fn index(self) -> u8 {
        match self {
            SyncStep::CreateTrip => 1,
            SyncStep::CreateSegment => 2,
            SyncStep::UploadArtifact => 3,
            SyncStep::CompleteSegment => 4,
            SyncStep::AttachTrack => 5,
            SyncStep::CompleteTrip => 6,
        }
    }

    fn label(self) -> &'static str {
        match self {
            SyncStep::CreateTrip => "create trip",
            SyncStep::CreateSegment => "create segment",
            SyncStep::UploadArtifact => "upload artifact",
            SyncStep::CompleteSegment => "complete segment",
            SyncStep::AttachTrack => "attach gps track",
            SyncStep::CompleteTrip => "complete trip",
        }
    }
}

/// A saga failure: which step failed and why. There is no automatic
/// rollback; resources created by earlier steps stay on the server.
#[derive(Debug, Clone, Error)]
#[error("sync step {} ({}) failed: {source}", step.index(), step.label())]
pub struct StepError {
    pub step: SyncStep,
    #[source]
    pub source: SyncError,
}

/// Remote identifiers assigned as the saga progresses. Each field is set
/// exactly once per session.
#[derive(Debug, Clone, Default)]
pub struct RemoteTripRef {
    pub trip_id: String,
    pub segment_id: String,
    pub upload_id: String,
}

/// Everything the saga needs from a stopped session.
pub struct SyncRequest<'a> {
    pub device_id: &'a str,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_s: u64,
    pub artifact: &'a ArtifactRef,
    pub data: &'a Bytes,
    pub samples: &'a [LocationSample],
}

/// Drives the create-trip → create-segment → upload → finalize saga.
///
/// Steps are strictly sequential; a failure halts the saga at that step
/// and surfaces it with the step index. Retrying a failed saga from the
/// top creates duplicate trip/segment resources unless the server
/// deduplicates by content hash.
pub struct SyncPipeline<'a> {
    api: &'a dyn RemoteApi,
    upload_config: &'a UploadConfig,
    capture: &'a CaptureConfig,
}

impl<'a> SyncPipeline<'a> {
    pub fn new(
        api: &'a dyn RemoteApi,
        upload_config: &'a UploadConfig,
        capture: &'a CaptureConfig,
    ) -> Self {
        SyncPipeline {
            api,
            upload_config,
            capture,
        }
    }

    pub async fn run(&self, req: SyncRequest<'_>) -> Result<RemoteTripRef, StepError> {
        let mut remote = RemoteTripRef::default();

        // 1. Trip shell with the session's start time.
        let trip = step(
            SyncStep::CreateTrip,
            self.api
                .create_trip(&TripCreate {
                    device_id: req.device_id.to_string(),
                    start_time_utc: req.started_at,
                })
                .await,
        )?;
        remote.trip_id = trip.id;
        tracing::info!(trip_id = %remote.trip_id, "trip created");

        // 2. Single segment (index 0) with the capture profile.
        let segment = step(
            SyncStep::CreateSegment,
            self.api
                .create_segment(
                    &remote.trip_id,
                    &SegmentCreate {
                        index: 0,
                        video_codec: self.capture.video_codec.clone(),
                        expected_bytes: req.artifact.byte_length,
                        width: self.capture.width,
                        height: self.capture.height,
                        fps: self.capture.fps,
                    },
                )
                .await,
        )?;
        remote.segment_id = segment.id;

        // 3. Upload intent, then the chunked byte transfer.
        let created = step(
            SyncStep::UploadArtifact,
            self.api
                .create_upload(&UploadCreate {
                    trip_id: remote.trip_id.clone(),
                    segment_id: remote.segment_id.clone(),
                    filename: self.capture.filename.clone(),
                    file_type: FILE_TYPE_VIDEO_MP4.into(),
                    sha256: req.artifact.content_hash.clone(),
                    upload_length: req.artifact.byte_length,
                })
                .await,
        )?;
        remote.upload_id = created.id.clone();

        let progress = step(
            SyncStep::UploadArtifact,
            UploadProgress::new(created.id, req.artifact.byte_length, created.offset),
        )?;
        let mut chunk_upload = ChunkUpload::new(progress);
        let uploader = Uploader::new(self.api, self.upload_config);
        step(
            SyncStep::UploadArtifact,
            uploader.transfer(&mut chunk_upload, req.data).await,
        )?;

        // 4. Seal the segment with the verified size and hash.
        step(
            SyncStep::CompleteSegment,
            self.api
                .complete_segment(
                    &remote.trip_id,
                    &remote.segment_id,
                    &SegmentComplete {
                        file_size_bytes: req.artifact.byte_length,
                        sha256: req.artifact.content_hash.clone(),
                        duration_s: req.duration_s as f64,
                        status: STATUS_COMPLETE.into(),
                    },
                )
                .await,
        )?;

        // 5. GPS track as JSONL metadata. An empty track is valid.
        step(
            SyncStep::AttachTrack,
            self.api
                .attach_metadata(
                    &remote.segment_id,
                    &SegmentMetadata {
                        file_type: FILE_TYPE_GPS_JSONL.into(),
                        content: track::to_jsonl(req.samples),
                        filename: "track.jsonl".into(),
                    },
                )
                .await,
        )?;

        // 6. Close the trip.
        step(
            SyncStep::CompleteTrip,
            self.api
                .complete_trip(
                    &remote.trip_id,
                    &TripComplete {
                        end_time_utc: req.stopped_at,
                        duration_s: req.duration_s,
                        status: STATUS_COMPLETE.into(),
                    },
                )
                .await,
        )?;

        tracing::info!(
            trip_id = %remote.trip_id,
            segment_id = %remote.segment_id,
            bytes = req.artifact.byte_length,
            samples = req.samples.len(),
            "trip synced"
        );
        Ok(remote)
    }
}

fn step<T>(step: SyncStep, result: Result<T, SyncError>) -> Result<T, StepError> {
    result.map_err(|source| {
        tracing::error!("sync step {} ({}) failed: {source}", step.index(), step.label());
        StepError { step, source }
    })
}
