//! Vision OCR client for an Ollama-compatible chat endpoint.
//!
//! One page image plus a text prompt goes out as a JSON body; the model's
//! `message.content` comes back as the recognised text. The pipeline treats
//! that text as opaque, with no normalisation beyond whitespace trimming.
//!
//! ## Retry strategy
//!
//! Vision backends fail transiently and often under load: 5xx, timeouts,
//! and (characteristic of the upstream model) blank responses that
//! succeed on the next attempt. All of those retry with exponential
//! backoff (1 s base, doubling, capped at 30 s). Client-side mistakes
//! (4xx other than 408/429, malformed response bodies) fail immediately;
//! retrying them only hammers a server that has already said no.

use crate::config::Settings;
use crate::error::OcrError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// OCR capability consumed by the orchestrator.
#[async_trait]
pub trait OcrClient: Send + Sync + 'static {
    /// Recognise the text on one page image.
    ///
    /// `cancel` is only consulted between attempts; an in-flight HTTP
    /// request runs to completion or timeout.
    async fn ocr_page(
        &self,
        jpeg: &[u8],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OcrError>;
}

/// Production client speaking the Ollama `/api/chat` protocol.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
    backoff_base: Duration,
}

impl OllamaClient {
    pub fn new(settings: &Settings) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.ocr_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: settings.ollama_base_url.trim_end_matches('/').to_string(),
            model: settings.ollama_model.clone(),
            max_retries: settings.ocr_retries.max(1),
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the backoff base; tests use a few milliseconds.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn attempt(&self, payload: &Value) -> Attempt {
        let response = match self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(payload)
            .send()
            .await
        {
            Ok(r) => r,
            // Connection failures and timeouts are the classic transient case.
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let status = response.status();
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Attempt::Retry(format!("HTTP {status}"));
        }
        if !status.is_success() {
            return Attempt::Fatal(format!("HTTP {status}"));
        }

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return Attempt::Fatal(format!("Malformed JSON response: {e}")),
        };

        // Ollama reports model-side trouble as a 200 with an "error" field;
        // in practice these clear on retry (model loading, VRAM pressure).
        if let Some(err) = body.get("error") {
            return Attempt::Retry(format!("Model returned error: {err}"));
        }

        let text = match body.pointer("/message/content").and_then(Value::as_str) {
            Some(t) => t.trim().to_string(),
            None => return Attempt::Fatal(format!("Response missing message.content: {body}")),
        };

        if text.is_empty() {
            // The upstream model occasionally returns blank on transient
            // overload; an empty page of a scanned book is not a real outcome.
            return Attempt::Retry("Model returned empty text".to_string());
        }
        Attempt::Ok(text)
    }
}

enum Attempt {
    Ok(String),
    Retry(String),
    Fatal(String),
}

#[async_trait]
impl OcrClient for OllamaClient {
    async fn ocr_page(
        &self,
        jpeg: &[u8],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OcrError> {
        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": prompt,
                "images": [STANDARD.encode(jpeg)],
            }],
            "stream": false,
        });

        let mut last = String::from("no attempt made");
        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                let delay = backoff_delay(self.backoff_base, attempt - 1);
                warn!(
                    "OCR attempt {}/{} failed: {last}. Retrying in {delay:?}",
                    attempt - 1,
                    self.max_retries
                );
                tokio::time::sleep(delay).await;
            }
            if cancel.is_cancelled() {
                return Err(OcrError::Cancelled);
            }

            match self.attempt(&payload).await {
                Attempt::Ok(text) => {
                    debug!("OCR succeeded on attempt {attempt} ({} chars)", text.len());
                    return Ok(text);
                }
                Attempt::Retry(cause) => last = cause,
                Attempt::Fatal(cause) => return Err(OcrError::Rejected(cause)),
            }
        }

        Err(OcrError::Exhausted {
            attempts: self.max_retries,
            last,
        })
    }
}

/// Delay before the `retry_index`-th retry (1-based): `base * 2^(k-1)`,
/// capped at 30 s.
fn backoff_delay(base: Duration, retry_index: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_index.saturating_sub(1));
    base.saturating_mul(factor).min(BACKOFF_CAP)
}
