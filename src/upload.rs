use crate::api::RemoteApi;
use crate::artifact::plan_chunks;
use crate::config::UploadConfig;
use crate::error::SyncError;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// How far the remote has acknowledged one upload intent.
///
/// The acknowledged offset never exceeds `total_length` and only moves
/// backwards through [`resync_to`](Self::resync_to); the orchestrator
/// resumes from it and never re-sends acknowledged bytes.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub upload_id: String,
    pub total_length: u64,
    acknowledged_offset: u64,
}

impl UploadProgress {
    /// Builds progress from a registered intent. The remote reports the
    /// initial offset, so an offset past the declared length is a
    /// protocol error, not a local bug.
    pub fn new(
        upload_id: String,
        total_length: u64,
        acknowledged_offset: u64,
    ) -> Result<Self, SyncError> {
        if acknowledged_offset > total_length {
            return Err(SyncError::Protocol {
                expected: total_length,
                acknowledged: acknowledged_offset,
            });
        }
        Ok(UploadProgress {
            upload_id,
            total_length,
            acknowledged_offset,
        })
    }

    pub fn acknowledged_offset(&self) -> u64 {
        self.acknowledged_offset
    }

    pub fn is_complete(&self) -> bool {
        self.acknowledged_offset == self.total_length
    }

    fn advance(&mut self, to: u64) {
        debug_assert!(to >= self.acknowledged_offset);
        debug_assert!(to <= self.total_length);
        self.acknowledged_offset = to;
    }

    /// Adopts the remote's reported offset, clamped to the declared
    /// length. The only path allowed to move the offset backwards.
    fn resync_to(&mut self, remote_offset: u64) {
        self.acknowledged_offset = remote_offset.min(self.total_length);
    }
}

/// One resumable chunk transfer to a registered upload intent.
pub struct ChunkUpload {
    pub progress: UploadProgress,
    state: UploadState,
}

impl ChunkUpload {
    pub fn new(progress: UploadProgress) -> Self {
        ChunkUpload {
            progress,
            state: UploadState::NotStarted,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }
}

/// Drives chunk sends for one upload: strictly sequential, offset-verified,
/// with bounded retry on transient transport failures.
pub struct Uploader<'a> {
    api: &'a dyn RemoteApi,
    config: &'a UploadConfig,
}

impl<'a> Uploader<'a> {
    pub fn new(api: &'a dyn RemoteApi, config: &'a UploadConfig) -> Self {
        Uploader { api, config }
    }

    /// Transfer all unacknowledged bytes of `data` to the remote upload.
    ///
    /// Resumes from the remote's reported offset when the intent already
    /// holds bytes. An acknowledgement that does not match the sent range
    /// is a protocol error: the transfer stops and the intent must be
    /// abandoned. Completion is implicit once every chunk is acknowledged;
    /// business-level finalization stays with the synchronizer.
    pub async fn transfer(&self, upload: &mut ChunkUpload, data: &Bytes) -> Result<(), SyncError> {
        if data.len() as u64 != upload.progress.total_length {
            return Err(SyncError::Validation(format!(
                "artifact is {} bytes but upload intent registered {}",
                data.len(),
                upload.progress.total_length
            )));
        }

        upload.state = UploadState::InProgress;

        // The remote's offset is authoritative when resuming an intent
        // that already received bytes.
        if upload.progress.acknowledged_offset() > 0 {
            let remote = self.api.upload_offset(&upload.progress.upload_id).await?;
            if remote != upload.progress.acknowledged_offset() {
                tracing::warn!(
                    upload_id = %upload.progress.upload_id,
                    local = upload.progress.acknowledged_offset(),
                    remote,
                    "resyncing acknowledged offset from remote"
                );
                upload.progress.resync_to(remote);
            }
        }

        let start = upload.progress.acknowledged_offset();
        let remaining = upload.progress.total_length - start;
        let plan = plan_chunks(remaining, self.config.chunk_size);
        tracing::info!(
            upload_id = %upload.progress.upload_id,
            total = upload.progress.total_length,
            resume_from = start,
            chunks = plan.len(),
            "starting chunk transfer"
        );

        for chunk in plan {
            let offset = start + chunk.offset;
            let end = offset + chunk.length;
            let body = data.slice(offset as usize..end as usize);

            let acked = match self.send_with_retry(&upload.progress.upload_id, offset, body).await
            {
                Ok(acked) => acked,
                Err(e) => {
                    upload.state = UploadState::Failed;
                    return Err(e);
                }
            };

            if acked != end {
                upload.state = UploadState::Failed;
                return Err(SyncError::Protocol {
                    expected: end,
                    acknowledged: acked,
                });
            }
            upload.progress.advance(acked);
            tracing::debug!(
                upload_id = %upload.progress.upload_id,
                acked,
                total = upload.progress.total_length,
                "chunk acknowledged"
            );
        }

        upload.state = UploadState::Completed;
        Ok(())
    }

    /// Send one chunk, retrying transient transport failures with the same
    /// offset. Non-transient errors and exhausted retries escalate.
    async fn send_with_retry(
        &self,
        upload_id: &str,
        offset: u64,
        body: Bytes,
    ) -> Result<u64, SyncError> {
        let mut attempt: u32 = 0;
        loop {
            match self.api.send_chunk(upload_id, offset, body.clone()).await {
                Ok(acked) => return Ok(acked),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        upload_id,
                        offset,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "chunk send failed, retrying: {e}"
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(6)).min(60_000);
        let jitter = fastrand::u64(0..=base / 2);
        Duration::from_millis(exp + jitter)
    }
}
