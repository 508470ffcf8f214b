//! Coordinator Client: synchronous request/response over the coordinator's
//! REST surface (§6). No retry at this layer — retry is the Supervisor's
//! (initiate/complete) or the URL Prefetcher's (presign) policy.

use chrono::{DateTime, Utc};
use haul_kernel::{AgentError, HttpClient, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct InitiateRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_fingerprint: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
    pub chunk_size: u64,
    pub total_parts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlEntry {
    pub part_number: u32,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct PresignResponse {
    urls: Vec<PresignedUrlEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
    pub parts: Vec<CompletePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponse {
    pub status: String,
    pub final_etag: Option<String>,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
}

/// HTTP client over the coordinator's `initiate`/`presign`/`complete`/`abort`
/// surface. Every request carries a correlation id, propagated into the
/// `tracing` span so a coordinator-side log line and this client's log line
/// for the same call can be joined (§4.4).
pub struct CoordinatorClient {
    http: HttpClient,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(http: HttpClient, base_url: String) -> Self {
        Self { http, base_url }
    }

    #[tracing::instrument(skip(self, request), fields(correlation_id = %Uuid::new_v4()))]
    pub async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse> {
        let url = format!("{}/api/upload/initiate", self.base_url);
        haul_kernel::http::log_request("POST", &url);
        let started = Instant::now();
        let response = self
            .http
            .inner()
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(network_err)?;
        haul_kernel::http::log_response(response.status().as_u16(), &url, started.elapsed());
        parse_json(response).await
    }

    #[tracing::instrument(skip(self), fields(correlation_id = %Uuid::new_v4()))]
    pub async fn presign(
        &self,
        upload_id: &str,
        bucket: &str,
        object_key: &str,
        part_numbers: &[u32],
    ) -> Result<Vec<PresignedUrlEntry>> {
        let csv = part_numbers
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{}/api/upload/presign?upload_id={}&bucket={}&object_key={}&part_numbers={}",
            self.base_url,
            urlencoding::encode(upload_id),
            urlencoding::encode(bucket),
            urlencoding::encode(object_key),
            urlencoding::encode(&csv),
        );
        haul_kernel::http::log_request("GET", &url);
        let started = Instant::now();
        let response = self.http.inner().get(&url).send().await.map_err(network_err)?;
        haul_kernel::http::log_response(response.status().as_u16(), &url, started.elapsed());
        let parsed: PresignResponse = parse_json(response).await?;
        Ok(parsed.urls)
    }

    #[tracing::instrument(skip(self, request), fields(correlation_id = %Uuid::new_v4()))]
    pub async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse> {
        let url = format!("{}/api/upload/complete", self.base_url);
        haul_kernel::http::log_request("POST", &url);
        let started = Instant::now();
        let response = self
            .http
            .inner()
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(network_err)?;
        haul_kernel::http::log_response(response.status().as_u16(), &url, started.elapsed());
        parse_json(response).await
    }

    #[tracing::instrument(skip(self, request), fields(correlation_id = %Uuid::new_v4()))]
    pub async fn abort(&self, request: &AbortRequest) -> Result<()> {
        let url = format!("{}/api/upload/abort", self.base_url);
        haul_kernel::http::log_request("POST", &url);
        let started = Instant::now();
        let response = self
            .http
            .inner()
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(network_err)?;
        haul_kernel::http::log_response(response.status().as_u16(), &url, started.elapsed());
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        Ok(())
    }
}

fn network_err(e: reqwest::Error) -> AgentError {
    AgentError::CoordinatorUnavailable { message: e.to_string() }
}

async fn status_err(response: reqwest::Response) -> AgentError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    AgentError::CoordinatorUnavailable {
        message: format!("coordinator returned {status}: {body}"),
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(status_err(response).await);
    }
    response.json::<T>().await.map_err(|e| AgentError::CoordinatorUnavailable {
        message: format!("malformed coordinator response: {e}"),
    })
}
