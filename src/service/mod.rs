//! Remote upload service client
//!
//! Collaborator contract for the session service that initiates a
//! multipart session, mints single-use per-part upload URLs and
//! finalizes the assembled object, plus the raw part transport (a PUT
//! of the byte range against a minted URL).
//!
//! The trait is the seam the coordinator depends on; the production
//! implementation speaks JSON over HTTP via `reqwest`.

use crate::session::CompletedPart;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Remote service and transport errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("{operation} returned status {status}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
    },

    #[error("Part transmission returned no ETag")]
    MissingEtag,
}

impl ServiceError {
    /// Transport-level failures (timeouts, connection resets, 5xx) are
    /// worth retrying; 4xx responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::RequestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            ServiceError::UnexpectedStatus { status, .. } => *status >= 500,
            ServiceError::MissingEtag => false,
        }
    }
}

/// Identifiers issued by the remote service at initiation
#[derive(Debug, Clone)]
pub struct InitiatedUpload {
    pub session_id: String,
    pub asset_id: String,
    pub storage_key: String,
}

/// Remote upload service contract
#[async_trait]
pub trait UploadService: Send + Sync {
    /// Begin a multipart session for a new object
    async fn initiate(
        &self,
        file_name: &str,
        content_type: &str,
    ) -> Result<InitiatedUpload, ServiceError>;

    /// Mint a time-limited, single-use upload URL for one part
    async fn part_upload_url(
        &self,
        asset_id: &str,
        session_id: &str,
        part_number: u32,
    ) -> Result<String, ServiceError>;

    /// Transmit one part's bytes against a minted URL.
    ///
    /// The ETag response header is the transport acknowledgment; its
    /// absence is a failure.
    async fn put_part(&self, url: &str, body: Bytes) -> Result<String, ServiceError>;

    /// Finalize the assembled object. Idempotent given an identical,
    /// fully-acknowledged part set.
    async fn complete(
        &self,
        asset_id: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ServiceError>;

    /// Release server-side resources for a discarded upload. Best
    /// effort; not required for client correctness.
    async fn abort(&self, asset_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Serialize)]
struct InitiateRequest<'a> {
    filename: &'a str,
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    upload_id: String,
    video_id: String,
    key: String,
}

#[derive(Debug, Serialize)]
struct PartUrlRequest<'a> {
    video_id: &'a str,
    upload_id: &'a str,
    part_number: u32,
}

#[derive(Debug, Deserialize)]
struct PartUrlResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct WirePart<'a> {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    video_id: &'a str,
    upload_id: &'a str,
    parts: Vec<WirePart<'a>>,
}

/// HTTP implementation of the upload service contract
pub struct HttpUploadService {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpUploadService {
    /// Create a client against the service base endpoint.
    ///
    /// A stalled call is a retryable transport failure, not a hang:
    /// every request carries `timeout`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn check_status(
        operation: &'static str,
        response: &reqwest::Response,
    ) -> Result<(), ServiceError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::UnexpectedStatus {
                operation,
                status: response.status().as_u16(),
            })
        }
    }
}

#[async_trait]
impl UploadService for HttpUploadService {
    #[tracing::instrument(
        name = "service.initiate",
        skip(self),
        fields(upload.file_name = %file_name),
        err
    )]
    async fn initiate(
        &self,
        file_name: &str,
        content_type: &str,
    ) -> Result<InitiatedUpload, ServiceError> {
        let response = self
            .client
            .post(self.url("/uploads/initiate"))
            .json(&InitiateRequest {
                filename: file_name,
                content_type,
            })
            .send()
            .await?;
        Self::check_status("initiate", &response)?;
        let body: InitiateResponse = response.json().await?;

        tracing::info!(
            session_id = %body.upload_id,
            asset_id = %body.video_id,
            storage_key = %body.key,
            "Initiated multipart session"
        );

        Ok(InitiatedUpload {
            session_id: body.upload_id,
            asset_id: body.video_id,
            storage_key: body.key,
        })
    }

    #[tracing::instrument(
        name = "service.part_url",
        skip(self),
        fields(session_id = %session_id, part_number = part_number),
        err
    )]
    async fn part_upload_url(
        &self,
        asset_id: &str,
        session_id: &str,
        part_number: u32,
    ) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(self.url("/uploads/presigned-url"))
            .json(&PartUrlRequest {
                video_id: asset_id,
                upload_id: session_id,
                part_number,
            })
            .send()
            .await?;
        Self::check_status("part_upload_url", &response)?;
        let body: PartUrlResponse = response.json().await?;
        Ok(body.url)
    }

    #[tracing::instrument(
        name = "service.put_part",
        skip(self, body),
        fields(upload.bytes = body.len()),
        err
    )]
    async fn put_part(&self, url: &str, body: Bytes) -> Result<String, ServiceError> {
        let response = self.client.put(url).body(body).send().await?;
        Self::check_status("put_part", &response)?;

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ServiceError::MissingEtag)?;

        Ok(etag)
    }

    #[tracing::instrument(
        name = "service.complete",
        skip(self, parts),
        fields(session_id = %session_id, parts_count = parts.len()),
        err
    )]
    async fn complete(
        &self,
        asset_id: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(self.url("/uploads/complete"))
            .json(&CompleteRequest {
                video_id: asset_id,
                upload_id: session_id,
                parts: parts
                    .iter()
                    .map(|p| WirePart {
                        part_number: p.part_number,
                        etag: &p.etag,
                    })
                    .collect(),
            })
            .send()
            .await?;
        Self::check_status("complete", &response)?;

        tracing::info!(asset_id = %asset_id, "Completed multipart session");
        Ok(())
    }

    #[tracing::instrument(name = "service.abort", skip(self), err)]
    async fn abort(&self, asset_id: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .delete(self.url(&format!("/uploads/{asset_id}")))
            .send()
            .await?;
        Self::check_status("abort", &response)
    }
}
