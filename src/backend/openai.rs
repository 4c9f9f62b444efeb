//! reqwest implementation of the OpenAI Files + Batches API.
//!
//! | Call | Endpoint |
//! |------|----------|
//! | upload | `POST {base}/files` multipart, `purpose=batch` |
//! | create | `POST {base}/batches` |
//! | status | `GET {base}/batches/{id}` |
//! | download | `GET {base}/files/{id}/content` |
//!
//! ## HTTP classification
//!
//! [`classify_response`] is a pure function of status code and body so it
//! can be tested without a server. Quota codes win over the status code: the
//! service reports an exhausted balance as 429 on some endpoints and 400 on
//! others.

use super::{BatchBackend, CreateBatch, RemoteBatch};
use crate::config::BatchConfig;
use crate::error::{BackendError, BatchError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Error codes meaning the account cannot pay for more work.
const QUOTA_CODES: &[&str] = &["insufficient_quota", "billing_hard_limit_reached"];

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

/// Map a non-success HTTP response to a [`BackendError`].
pub fn classify_response(status: u16, retry_after_secs: Option<u64>, body: &str) -> BackendError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let detail = parsed
        .as_ref()
        .and_then(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| truncate(body, 300));

    let is_quota = parsed.as_ref().is_some_and(|e| {
        [e.code.as_deref(), e.kind.as_deref()]
            .into_iter()
            .flatten()
            .any(|c| QUOTA_CODES.contains(&c))
    }) || QUOTA_CODES.iter().any(|c| body.contains(c));

    if is_quota {
        return BackendError::Quota { detail };
    }

    match status {
        401 | 403 => BackendError::Auth { detail },
        429 => BackendError::RateLimited {
            detail,
            retry_after_secs,
        },
        404 => BackendError::NotFound { resource: detail },
        408 => BackendError::Timeout { detail },
        500..=599 => BackendError::Server { status, detail },
        _ => BackendError::BadRequest { status, detail },
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            detail: err.to_string(),
        }
    } else if err.is_decode() {
        BackendError::Decode {
            detail: err.to_string(),
        }
    } else {
        BackendError::Network {
            detail: err.to_string(),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Client for an OpenAI-compatible batch service.
#[derive(Debug, Clone)]
pub struct OpenAiBatchClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBatchClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BatchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(timeout)
            .build()
            .map_err(|e| BatchError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Build from a [`BatchConfig`]; the API key must be set.
    pub fn from_config(config: &BatchConfig) -> Result<Self, BatchError> {
        let key = config.api_key.as_deref().filter(|k| !k.is_empty()).ok_or_else(|| {
            BatchError::InvalidConfig(
                "no API key configured.\nSet OPENAI_API_KEY or pass --api-key.".into(),
            )
        })?;
        Self::new(
            &config.base_url,
            key,
            Duration::from_secs(config.api_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BackendError> {
        let resp = req
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(classify_response(status.as_u16(), retry_after, &body))
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
        let raw = resp.text().await.map_err(transport_error)?;
        serde_json::from_str(&raw).map_err(|e| BackendError::Decode {
            detail: format!("{e}: {}", truncate(&raw, 200)),
        })
    }
}

#[async_trait]
impl BatchBackend for OpenAiBatchClient {
    async fn upload_requests(
        &self,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<String, BackendError> {
        let size = body.len();
        let part = Part::bytes(body)
            .file_name(file_name.to_string())
            .mime_str("application/jsonl")
            .map_err(|e| BackendError::Decode {
                detail: e.to_string(),
            })?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let resp = self
            .send(self.client.post(self.url("/files")).multipart(form))
            .await?;
        let file: UploadedFile = Self::json(resp).await?;
        debug!("Uploaded {} ({} bytes) → {}", file_name, size, file.id);
        Ok(file.id)
    }

    async fn create_batch(&self, request: CreateBatch<'_>) -> Result<RemoteBatch, BackendError> {
        let payload = json!({
            "input_file_id": request.input_file_id,
            "endpoint": request.endpoint,
            "completion_window": request.completion_window,
            "metadata": { "description": request.description },
        });
        let resp = self
            .send(self.client.post(self.url("/batches")).json(&payload))
            .await?;
        Self::json(resp).await
    }

    async fn get_batch(&self, job_id: &str) -> Result<RemoteBatch, BackendError> {
        let resp = self
            .send(self.client.get(self.url(&format!("/batches/{job_id}"))))
            .await?;
        Self::json(resp).await
    }

    async fn download_file(&self, file_id: &str) -> Result<String, BackendError> {
        let resp = self
            .send(self.client.get(self.url(&format!("/files/{file_id}/content"))))
            .await?;
        resp.text().await.map_err(transport_error)
    }
}
