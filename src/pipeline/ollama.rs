//! Reference analyzer backed by an Ollama instance.
//!
//! One client implements both analyzer traits: text completion through
//! `/api/generate`, vision through the same endpoint with base64 image
//! attachments. Deployments with hosted providers implement the traits
//! directly and skip this module.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::types::{ImagePayload, TextAnalyzer, VisionAnalyzer};
use super::{AnalysisError, ProviderErrorKind};

/// Vision-capable models to try, in order of preference.
const PREFERRED_MODELS: &[&str] = &["llama3.2-vision", "llava", "llava:13b", "llava:latest"];

pub struct OllamaAnalyzer {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OllamaAnalyzer {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        }
    }

    /// Default local instance at localhost:11434 with a 5-minute timeout.
    pub fn default_local(model: &str) -> Self {
        Self::new("http://localhost:11434", model, 300)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Find the best available vision-capable model.
    pub async fn find_best_model(&self) -> Result<String, AnalysisError> {
        let available = self.list_models().await?;
        for preferred in PREFERRED_MODELS {
            if available.iter().any(|m| m.starts_with(preferred)) {
                return Ok(preferred.to_string());
            }
        }
        Err(AnalysisError::provider(
            ProviderErrorKind::Unknown,
            "no vision-capable model available on Ollama",
        ))
    }

    pub async fn is_model_available(&self, model: &str) -> Result<bool, AnalysisError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }

    pub async fn list_models(&self) -> Result<Vec<String>, AnalysisError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Parse(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate(
        &self,
        prompt: &str,
        system: &str,
        images: Option<Vec<String>>,
    ) -> Result<String, AnalysisError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
            images,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Parse(e.to_string()))?;
        Ok(parsed.response)
    }

    fn map_request_error(&self, e: reqwest::Error) -> AnalysisError {
        if e.is_connect() {
            AnalysisError::provider(
                ProviderErrorKind::Connection,
                format!("cannot reach Ollama at {}", self.base_url),
            )
        } else if e.is_timeout() {
            AnalysisError::provider(
                ProviderErrorKind::Timeout,
                format!("request timed out after {}s", self.timeout_secs),
            )
        } else {
            AnalysisError::provider(ProviderErrorKind::Unknown, e.to_string())
        }
    }
}

/// Map an HTTP error status onto the provider error taxonomy.
fn status_error(status: StatusCode, body: &str) -> AnalysisError {
    let kind = if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderErrorKind::RateLimit
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ProviderErrorKind::Authentication
    } else if status.is_server_error() {
        ProviderErrorKind::ServerError
    } else {
        ProviderErrorKind::Unknown
    };
    AnalysisError::provider(kind, format!("status {}: {}", status.as_u16(), body))
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

#[async_trait]
impl VisionAnalyzer for OllamaAnalyzer {
    async fn analyze(
        &self,
        prompt: &str,
        system: &str,
        image: &ImagePayload,
    ) -> Result<String, AnalysisError> {
        let encoded = match image {
            ImagePayload::Bytes { data, .. } => BASE64.encode(data),
            ImagePayload::Url(url) => {
                // Ollama cannot fetch URLs itself; pull the bytes first.
                let bytes = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| self.map_request_error(e))?
                    .bytes()
                    .await
                    .map_err(|e| self.map_request_error(e))?;
                BASE64.encode(&bytes)
            }
        };

        self.generate(prompt, system, Some(vec![encoded])).await
    }
}

#[async_trait]
impl TextAnalyzer for OllamaAnalyzer {
    async fn complete(&self, prompt: &str, system: &str) -> Result<String, AnalysisError> {
        self.generate(prompt, system, None).await
    }
}

/// Mock vision analyzer for tests — configurable response, optionally
/// failing the first N calls or every call.
pub struct MockVisionAnalyzer {
    response: String,
    fail_first: u32,
    always_fail: bool,
    fail_kind: ProviderErrorKind,
    calls: Arc<AtomicU32>,
}

impl MockVisionAnalyzer {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            fail_first: 0,
            always_fail: false,
            fail_kind: ProviderErrorKind::Unknown,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(kind: ProviderErrorKind) -> Self {
        Self {
            response: String::new(),
            fail_first: 0,
            always_fail: true,
            fail_kind: kind,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn fail_then_succeed(failures: u32, response: &str, kind: ProviderErrorKind) -> Self {
        Self {
            response: response.to_string(),
            fail_first: failures,
            always_fail: false,
            fail_kind: kind,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl VisionAnalyzer for MockVisionAnalyzer {
    async fn analyze(
        &self,
        _prompt: &str,
        _system: &str,
        _image: &ImagePayload,
    ) -> Result<String, AnalysisError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || n < self.fail_first {
            return Err(AnalysisError::provider(
                self.fail_kind,
                "mock vision failure",
            ));
        }
        Ok(self.response.clone())
    }
}

/// Mock text analyzer with the same failure scripting.
pub struct MockTextAnalyzer {
    response: String,
    fail_first: u32,
    always_fail: bool,
    fail_kind: ProviderErrorKind,
    calls: Arc<AtomicU32>,
}

impl MockTextAnalyzer {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            fail_first: 0,
            always_fail: false,
            fail_kind: ProviderErrorKind::Unknown,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(kind: ProviderErrorKind) -> Self {
        Self {
            response: String::new(),
            fail_first: 0,
            always_fail: true,
            fail_kind: kind,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn fail_then_succeed(failures: u32, response: &str, kind: ProviderErrorKind) -> Self {
        Self {
            response: response.to_string(),
            fail_first: failures,
            always_fail: false,
            fail_kind: kind,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl TextAnalyzer for MockTextAnalyzer {
    async fn complete(&self, _prompt: &str, _system: &str) -> Result<String, AnalysisError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || n < self.fail_first {
            return Err(AnalysisError::provider(self.fail_kind, "mock text failure"));
        }
        Ok(self.response.clone())
    }
}
