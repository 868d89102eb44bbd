//! reqwest-backed provider clients.
//!
//! All endpoints speak JSON with bearer auth. Status classification is
//! shared: 401/403 are fatal auth failures, 429 is a retryable rate limit,
//! 5xx is a retryable upstream error, any other non-success is fatal.
//! Every call is bounded by a per-call timeout and a response-size cap.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;

use crate::config::ProviderEndpoint;
use crate::error::KilnError;
use crate::providers::{
    GeneratedImage, ImageGenerator, ModelGenerator, ModelPoll, ModelResult, PromptRefiner,
    SliceStatus, Slicer,
};

/// Max JSON response body.
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Max binary payload (model archives can be large).
const MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;

fn build_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .expect("failed to build provider HTTP client")
}

/// Map a non-success status to the shared error taxonomy.
fn classify_status(provider: &str, status: StatusCode, context: &str) -> KilnError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => KilnError::AuthFailed {
            provider: provider.to_string(),
            message: format!("{context}: HTTP {status}"),
        },
        StatusCode::TOO_MANY_REQUESTS => KilnError::RateLimited {
            provider: provider.to_string(),
        },
        other => KilnError::Upstream {
            provider: provider.to_string(),
            message: format!("{context}: HTTP {other}"),
            status: Some(other.as_u16()),
        },
    }
}

async fn read_capped(response: Response, max_bytes: usize) -> Result<Vec<u8>, KilnError> {
    let mut response = response;
    let mut body = Vec::with_capacity(64 * 1024);
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > max_bytes {
            return Err(KilnError::Parse(format!(
                "response exceeds {max_bytes} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn json_response(
    provider: &str,
    context: &str,
    response: Response,
) -> Result<serde_json::Value, KilnError> {
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(provider, status, context));
    }
    let body = read_capped(response, MAX_RESPONSE_BYTES).await?;
    serde_json::from_slice(&body)
        .map_err(|e| KilnError::Parse(format!("{provider} {context} response: {e}")))
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, KilnError>>,
) -> Result<T, KilnError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| KilnError::Timeout(timeout.as_millis() as u64))?
}

// ---------------------------------------------------------------------------
// Image generation
// ---------------------------------------------------------------------------

pub struct HttpImageGenerator {
    client: Client,
    endpoint: ProviderEndpoint,
    call_timeout: Duration,
}

impl HttpImageGenerator {
    pub fn new(endpoint: ProviderEndpoint, call_timeout: Duration) -> Self {
        Self {
            client: build_client(),
            endpoint,
            call_timeout,
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    fn name(&self) -> &str {
        "image-http"
    }

    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, KilnError> {
        let url = format!("{}/v1/images", self.endpoint.base_url.trim_end_matches('/'));
        let body = json!({ "prompt": prompt, "n": 1 });

        let result = with_timeout(self.call_timeout, async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.endpoint.api_key)
                .json(&body)
                .send()
                .await?;
            let value = json_response(self.name(), "generate", response).await?;
            let image_url = value["url"]
                .as_str()
                .ok_or_else(|| KilnError::Parse("generate response missing 'url'".into()))?
                .to_string();

            // The provider hands back a result URL; fetch the bytes here so
            // the worker's upload is provider-agnostic.
            let download = self
                .client
                .get(&image_url)
                .bearer_auth(&self.endpoint.api_key)
                .send()
                .await?;
            let status = download.status();
            if !status.is_success() {
                return Err(classify_status(self.name(), status, "image download"));
            }
            let content_type = download
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("image/png")
                .to_string();
            let bytes = read_capped(download, MAX_ARTIFACT_BYTES).await?;
            Ok(GeneratedImage { bytes, content_type })
        })
        .await?;

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// 3D generation
// ---------------------------------------------------------------------------

pub struct HttpModelGenerator {
    client: Client,
    endpoint: ProviderEndpoint,
    submit_timeout: Duration,
    poll_timeout: Duration,
    download_timeout: Duration,
}

impl HttpModelGenerator {
    pub fn new(
        endpoint: ProviderEndpoint,
        submit_timeout: Duration,
        poll_timeout: Duration,
        download_timeout: Duration,
    ) -> Self {
        Self {
            client: build_client(),
            endpoint,
            submit_timeout,
            poll_timeout,
            download_timeout,
        }
    }
}

#[async_trait]
impl ModelGenerator for HttpModelGenerator {
    fn name(&self) -> &str {
        "model-http"
    }

    async fn submit(&self, image_url: &str) -> Result<String, KilnError> {
        let url = format!("{}/v1/models", self.endpoint.base_url.trim_end_matches('/'));
        let body = json!({ "image_url": image_url });

        with_timeout(self.submit_timeout, async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.endpoint.api_key)
                .json(&body)
                .send()
                .await?;
            let value = json_response(self.name(), "submit", response).await?;
            value["job_id"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| KilnError::Parse("submit response missing 'job_id'".into()))
        })
        .await
    }

    async fn poll(&self, provider_job_id: &str) -> Result<ModelPoll, KilnError> {
        let url = format!(
            "{}/v1/models/{provider_job_id}",
            self.endpoint.base_url.trim_end_matches('/')
        );

        with_timeout(self.poll_timeout, async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.endpoint.api_key)
                .send()
                .await?;
            let value = json_response(self.name(), "poll", response).await?;

            let progress = value["progress"].as_u64().map(|p| p.min(100) as u8);
            match value["status"].as_str() {
                Some("queued" | "running" | "in_progress") => {
                    Ok(ModelPoll::InProgress { progress })
                }
                Some("succeeded" | "completed") => {
                    let result_url = value["result_url"]
                        .as_str()
                        .ok_or_else(|| {
                            KilnError::Parse("poll response missing 'result_url'".into())
                        })?
                        .to_string();
                    let preview_url = value["preview_url"]
                        .as_str()
                        .ok_or_else(|| {
                            KilnError::Parse("poll response missing 'preview_url'".into())
                        })?
                        .to_string();
                    let format = value["format"].as_str().map(str::to_string);
                    Ok(ModelPoll::Succeeded(ModelResult {
                        result_url,
                        preview_url,
                        format,
                    }))
                }
                Some(status @ ("failed" | "cancelled")) => {
                    let message = value["error"].as_str().unwrap_or(status).to_string();
                    Ok(ModelPoll::Failed { message })
                }
                Some(other) => Ok(ModelPoll::Failed {
                    message: format!("unknown status: {other}"),
                }),
                None => Err(KilnError::Parse("poll response missing 'status'".into())),
            }
        })
        .await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, KilnError> {
        with_timeout(self.download_timeout, async {
            let response = self
                .client
                .get(url)
                .bearer_auth(&self.endpoint.api_key)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(classify_status(self.name(), status, "download"));
            }
            read_capped(response, MAX_ARTIFACT_BYTES).await
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Prompt refinement
// ---------------------------------------------------------------------------

/// System prompt used when splitting one prompt into four style variants.
const VARIANTS_SYSTEM: &str = "You rewrite a 3D-asset prompt into exactly four \
style variants, one per line, no numbering: photorealistic, cartoon, \
low-poly, and sculptural. Keep the subject identical in every line.";

pub struct HttpPromptRefiner {
    client: Client,
    endpoint: ProviderEndpoint,
    call_timeout: Duration,
}

impl HttpPromptRefiner {
    pub fn new(endpoint: ProviderEndpoint, call_timeout: Duration) -> Self {
        Self {
            client: build_client(),
            endpoint,
            call_timeout,
        }
    }
}

#[async_trait]
impl PromptRefiner for HttpPromptRefiner {
    async fn chat(&self, system: &str, user: &str) -> Result<String, KilnError> {
        let url = format!("{}/v1/chat", self.endpoint.base_url.trim_end_matches('/'));
        let body = json!({ "system": system, "user": user });

        with_timeout(self.call_timeout, async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.endpoint.api_key)
                .json(&body)
                .send()
                .await?;
            let value = json_response("llm-http", "chat", response).await?;
            value["text"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| KilnError::Parse("chat response missing 'text'".into()))
        })
        .await
    }

    async fn variants(&self, user: &str, system: &str) -> Result<[String; 4], KilnError> {
        let system = if system.is_empty() { VARIANTS_SYSTEM } else { system };
        let text = self.chat(system, user).await?;
        parse_variants(&text)
    }
}

/// Extract exactly four non-empty variant lines from LLM output.
pub fn parse_variants(text: &str) -> Result<[String; 4], KilnError> {
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', ' ']).to_string())
        .filter(|line| !line.is_empty())
        .take(4)
        .collect();

    <[String; 4]>::try_from(lines)
        .map_err(|got| KilnError::Parse(format!("expected 4 variant lines, got {}", got.len())))
}

// ---------------------------------------------------------------------------
// Slicer
// ---------------------------------------------------------------------------

pub struct HttpSlicer {
    client: Client,
    endpoint: ProviderEndpoint,
    call_timeout: Duration,
}

impl HttpSlicer {
    pub fn new(endpoint: ProviderEndpoint, call_timeout: Duration) -> Self {
        Self {
            client: build_client(),
            endpoint,
            call_timeout,
        }
    }
}

#[async_trait]
impl Slicer for HttpSlicer {
    async fn create_slice_task(
        &self,
        object_url: &str,
        file_name: &str,
    ) -> Result<String, KilnError> {
        let url = format!("{}/v1/slices", self.endpoint.base_url.trim_end_matches('/'));
        let body = json!({ "object_url": object_url, "file_name": file_name });

        with_timeout(self.call_timeout, async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.endpoint.api_key)
                .json(&body)
                .send()
                .await?;
            let value = json_response("slicer-http", "create_slice_task", response).await?;
            value["task_id"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| KilnError::Parse("slice response missing 'task_id'".into()))
        })
        .await
    }

    async fn slice_task_status(&self, slice_task_id: &str) -> Result<SliceStatus, KilnError> {
        let url = format!(
            "{}/v1/slices/{slice_task_id}",
            self.endpoint.base_url.trim_end_matches('/')
        );

        with_timeout(self.call_timeout, async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.endpoint.api_key)
                .send()
                .await?;
            let value = json_response("slicer-http", "slice_task_status", response).await?;
            Ok(SliceStatus {
                status: value["status"].as_str().unwrap_or("unknown").to_string(),
                progress: value["progress"].as_u64().map(|p| p.min(100) as u8),
                gcode_url: value["gcode_url"].as_str().map(str::to_string),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_parse_four_clean_lines() {
        let text = "a photorealistic fox\n- a cartoon fox\n* a low-poly fox\na sculptural fox\n";
        let variants = parse_variants(text).unwrap();
        assert_eq!(variants[0], "a photorealistic fox");
        assert_eq!(variants[1], "a cartoon fox");
        assert_eq!(variants[2], "a low-poly fox");
        assert_eq!(variants[3], "a sculptural fox");
    }

    #[test]
    fn variants_reject_short_output() {
        let err = parse_variants("only one line").unwrap_err();
        assert!(matches!(err, KilnError::Parse(_)));
    }
}
