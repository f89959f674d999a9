//! Submission gateway: payload shapes and the HTTP client for the backend.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use presence_core::{FaceErrorCode, Sample, StillImage};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// The server refused the payload; the message is user-actionable.
    #[error("{message}")]
    Rejected { status: u16, message: String },
    /// Worth retrying later. Carries the server message when there is one.
    #[error("{0}")]
    Transient(String),
    #[error("unexpected server response: {0}")]
    InvalidResponse(String),
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendancePhase {
    Checkin,
    Checkout,
}

impl std::fmt::Display for AttendancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Checkin => "checkin",
            Self::Checkout => "checkout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplePayload {
    /// `data:` URL of the encoded still.
    pub image: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentPayload {
    pub descriptors: Vec<Vec<f32>>,
    pub samples: Vec<SamplePayload>,
}

impl EnrollmentPayload {
    /// Build from analyzed samples. `None` if any sample lacks a descriptor.
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        let descriptors = samples
            .iter()
            .map(|s| s.descriptor.as_ref().map(|d| d.values.clone()))
            .collect::<Option<Vec<_>>>()?;
        let samples = samples
            .iter()
            .map(|s| SamplePayload {
                image: data_url(&s.image),
                captured_at: s.captured_at,
            })
            .collect();
        Some(Self { descriptors, samples })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    /// Base64 of the encoded image, without a `data:` prefix.
    pub data: String,
    pub mime_type: String,
    pub file_name: String,
}

impl Evidence {
    pub fn from_still(image: &StillImage, fallback_name: &str) -> Self {
        Self {
            data: STANDARD.encode(image.encoded()),
            mime_type: image.mime_type().to_string(),
            file_name: image
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| fallback_name.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationPayload {
    pub status: String,
    pub phase: AttendancePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_descriptor: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_error: Option<FaceErrorCode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileStatus {
    pub registered: bool,
    pub descriptors_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnrollmentReceipt {
    #[serde(default)]
    pub profile: ProfileStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttendanceReceipt {
    pub message: String,
}

/// Backend endpoints consuming enrollment and attendance payloads.
#[async_trait]
pub trait SubmissionGateway: Send + Sync {
    async fn enroll(&self, payload: &EnrollmentPayload) -> Result<EnrollmentReceipt, SubmissionError>;

    async fn submit_attendance(
        &self,
        payload: &VerificationPayload,
    ) -> Result<AttendanceReceipt, SubmissionError>;

    async fn profile_status(&self) -> Result<ProfileStatus, SubmissionError>;
}

pub fn data_url(image: &StillImage) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type(),
        STANDARD.encode(image.encoded())
    )
}

/// JSON-over-HTTP gateway with optional bearer-token auth.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SubmissionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::Transient(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, SubmissionError> {
        let resp = req
            .send()
            .await
            .map_err(|e| SubmissionError::Transient(format!("could not reach server: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| SubmissionError::InvalidResponse(e.to_string()));
        }

        let body = resp.text().await.unwrap_or_default();
        let message = server_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        tracing::warn!(status = status.as_u16(), %message, "submission refused");
        Err(classify(status, message))
    }
}

#[async_trait]
impl SubmissionGateway for HttpGateway {
    async fn enroll(&self, payload: &EnrollmentPayload) -> Result<EnrollmentReceipt, SubmissionError> {
        tracing::info!(samples = payload.samples.len(), "submitting enrollment");
        self.send(self.request(reqwest::Method::POST, "/face/enroll").json(payload))
            .await
    }

    async fn submit_attendance(
        &self,
        payload: &VerificationPayload,
    ) -> Result<AttendanceReceipt, SubmissionError> {
        tracing::info!(
            phase = %payload.phase,
            evidence = payload.evidence.is_some(),
            descriptor = payload.face_descriptor.is_some(),
            face_error = ?payload.face_error,
            "submitting attendance"
        );
        self.send(self.request(reqwest::Method::POST, "/attendance").json(payload))
            .await
    }

    async fn profile_status(&self) -> Result<ProfileStatus, SubmissionError> {
        self.send(self.request(reqwest::Method::GET, "/face/status")).await
    }
}

fn classify(status: StatusCode, message: String) -> SubmissionError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        SubmissionError::Transient(message)
    } else {
        SubmissionError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

/// Pull `message` (or `error`) out of a JSON error body.
fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(key)?.as_str().map(str::to_string))
}
