use crate::error::SyncError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const FILE_TYPE_VIDEO_MP4: &str = "video_mp4";
pub const FILE_TYPE_GPS_JSONL: &str = "gps_jsonl";
pub const STATUS_COMPLETE: &str = "complete";

const UPLOAD_OFFSET_HEADER: &str = "Upload-Offset";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

// ── request bodies ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TripCreate {
    pub device_id: String,
    pub start_time_utc: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SegmentCreate {
    pub index: u32,
    pub video_codec: String,
    pub expected_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Serialize)]
pub struct UploadCreate {
    pub trip_id: String,
    pub segment_id: String,
    pub filename: String,
    pub file_type: String,
    pub sha256: String,
    pub upload_length: u64,
}

#[derive(Debug, Serialize)]
pub struct SegmentComplete {
    pub file_size_bytes: u64,
    pub sha256: String,
    pub duration_s: f64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct SegmentMetadata {
    #[serde(rename = "type")]
    pub file_type: String,
    pub content: String,
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct TripComplete {
    pub end_time_utc: DateTime<Utc>,
    pub duration_s: u64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceRegister {
    pub platform: String,
    pub model: String,
    pub os_version: String,
    pub app_version: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    email: &'a str,
    password: &'a str,
}

// ── response bodies ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TripRead {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentRead {
    pub id: String,
    pub index: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRead {
    pub id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRead {
    pub id: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRead {
    pub id: String,
    pub platform: String,
}

// ── remote protocol seam ─────────────────────────────────────────────────

/// The remote trip-service operations the sync pipeline depends on.
///
/// `ApiClient` is the real implementation; tests drive the pipeline with
/// an in-memory fake.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_trip(&self, req: &TripCreate) -> Result<TripRead, SyncError>;

    async fn create_segment(
        &self,
        trip_id: &str,
        req: &SegmentCreate,
    ) -> Result<SegmentRead, SyncError>;

    async fn create_upload(&self, req: &UploadCreate) -> Result<UploadRead, SyncError>;

    /// Transmit the bytes for `[offset, offset + body.len())`. Returns the
    /// cumulative offset the remote acknowledges.
    async fn send_chunk(&self, upload_id: &str, offset: u64, body: Bytes)
        -> Result<u64, SyncError>;

    /// Probe the remote's current acknowledged offset for an upload intent.
    async fn upload_offset(&self, upload_id: &str) -> Result<u64, SyncError>;

    async fn complete_segment(
        &self,
        trip_id: &str,
        segment_id: &str,
        req: &SegmentComplete,
    ) -> Result<SegmentRead, SyncError>;

    async fn attach_metadata(
        &self,
        segment_id: &str,
        req: &SegmentMetadata,
    ) -> Result<(), SyncError>;

    async fn complete_trip(&self, trip_id: &str, req: &TripComplete)
        -> Result<TripRead, SyncError>;
}

// ── reqwest-backed client ────────────────────────────────────────────────

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Authenticate against the server and return a client carrying the
    /// bearer token, plus the user profile. Auth failures are never
    /// retried.
    pub async fn login(
        base_url: &str,
        email: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<(ApiClient, UserRead), SyncError> {
        let base = base_url.trim_end_matches('/');
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let resp = http
            .post(format!("{base}/auth/token"))
            .json(&TokenRequest { email, password })
            .send()
            .await?;
        let token: TokenResponse = Self::check(resp).await?.json().await?;
        tracing::debug!(user_id = %token.user_id, "token issued");

        let client = ApiClient {
            http,
            base_url: base.to_string(),
            token: token.access_token,
        };
        let me = client.me().await?;
        tracing::info!("authenticated as {} (role {})", me.email, me.role);
        Ok((client, me))
    }

    pub async fn me(&self) -> Result<UserRead, SyncError> {
        let resp = self.get("/me").send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Register this device. The server treats registration as
    /// create-or-fetch; the returned id is opaque to the client.
    pub async fn register_device(&self, req: &DeviceRegister) -> Result<DeviceRead, SyncError> {
        let resp = self.post("/devices/register").json(req).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn patch(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.patch(self.url(path)).bearer_auth(&self.token)
    }

    /// Surface non-2xx responses with status and body as error detail.
    /// 401/403 mean the token or permissions are bad, which no retry can
    /// fix.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SyncError::Precondition(format!(
                "auth rejected ({}): {}",
                status.as_u16(),
                detail
            )));
        }
        Err(SyncError::Registration {
            status: status.as_u16(),
            detail,
        })
    }

    fn acked_offset(resp: &reqwest::Response) -> Result<u64, SyncError> {
        resp.headers()
            .get(UPLOAD_OFFSET_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                SyncError::Transport(format!("response missing {UPLOAD_OFFSET_HEADER} header"))
            })
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn create_trip(&self, req: &TripCreate) -> Result<TripRead, SyncError> {
        let resp = self.post("/trips").json(req).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn create_segment(
        &self,
        trip_id: &str,
        req: &SegmentCreate,
    ) -> Result<SegmentRead, SyncError> {
        let resp = self
            .post(&format!("/trips/{trip_id}/segments"))
            .json(req)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn create_upload(&self, req: &UploadCreate) -> Result<UploadRead, SyncError> {
        let resp = self.post("/uploads").json(req).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn send_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        body: Bytes,
    ) -> Result<u64, SyncError> {
        let resp = self
            .patch(&format!("/uploads/{upload_id}"))
            .header(reqwest::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE)
            .header(UPLOAD_OFFSET_HEADER, offset.to_string())
            .body(body)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Self::acked_offset(&resp)
    }

    async fn upload_offset(&self, upload_id: &str) -> Result<u64, SyncError> {
        let resp = self
            .http
            .head(self.url(&format!("/uploads/{upload_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Self::acked_offset(&resp)
    }

    async fn complete_segment(
        &self,
        trip_id: &str,
        segment_id: &str,
        req: &SegmentComplete,
    ) -> Result<SegmentRead, SyncError> {
        let resp = self
            .patch(&format!("/trips/{trip_id}/segments/{segment_id}"))
            .json(req)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn attach_metadata(
        &self,
        segment_id: &str,
        req: &SegmentMetadata,
    ) -> Result<(), SyncError> {
        let resp = self
            .post(&format!("/segments/{segment_id}/metadata"))
            .json(req)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn complete_trip(
        &self,
        trip_id: &str,
        req: &TripComplete,
    ) -> Result<TripRead, SyncError> {
        let resp = self.patch(&format!("/trips/{trip_id}")).json(req).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_create_wire_shape() {
        let req = UploadCreate {
            trip_id: "t1".into(),
            segment_id: "s1".into(),
            filename: "segment.mp4".into(),
            file_type: FILE_TYPE_VIDEO_MP4.into(),
            sha256: "ab".repeat(32),
            upload_length: 12_000_000,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["file_type"], "video_mp4");
        assert_eq!(v["upload_length"], 12_000_000);
        assert_eq!(v["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_metadata_type_field_renamed() {
        let req = SegmentMetadata {
            file_type: FILE_TYPE_GPS_JSONL.into(),
            content: String::new(),
            filename: "track.jsonl".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "gps_jsonl");
        assert!(v.get("file_type").is_none());
    }

    #[test]
    fn test_trip_create_uses_rfc3339_utc() {
        let req = TripCreate {
            device_id: "d1".into(),
            start_time_utc: "2025-06-01T12:00:00Z".parse().unwrap(),
        };
        let v = serde_json::to_value(&req).unwrap();
        let ts = v["start_time_utc"].as_str().unwrap();
        assert!(ts.starts_with("2025-06-01T12:00:00"));
    }

    #[test]
    fn test_responses_tolerate_extra_fields() {
        let trip: TripRead = serde_json::from_str(
            r#"{"id":"t1","device_id":"d1","status":"recording","duration_s":null}"#,
        )
        .unwrap();
        assert_eq!(trip.id, "t1");
        assert_eq!(trip.status, "recording");

        let upload: UploadRead = serde_json::from_str(
            r#"{"id":"u1","trip_id":"t1","segment_id":"s1","offset":0,"status":"pending"}"#,
        )
        .unwrap();
        assert_eq!(upload.offset, 0);
    }
}
