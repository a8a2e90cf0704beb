use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::TierKind;
use crate::error::GustError;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Shared OpenAI-compatible chat completion client for the local and remote tiers.
pub struct HttpDispatch {
    client: Client,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatch {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    /// Returns true if `url` answers with a success status within `timeout`.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url, "probe failed: {e}");
                false
            }
        }
    }

    pub async fn complete(
        &self,
        backend: TierKind,
        url: &str,
        api_key: Option<&str>,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, GustError> {
        let start = Instant::now();

        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&body);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GustError::Timeout(start.elapsed().as_millis() as u64)
            } else {
                GustError::Request(e)
            }
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GustError::Inference {
                backend,
                message: "rate limited, try again shortly".to_string(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GustError::Inference {
                backend,
                message: format!("authentication failed ({})", status.as_u16()),
            });
        }

        // Error bodies are logged, never surfaced: they may echo keys or URLs.
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(4096)];
            tracing::warn!(
                %backend,
                status = status.as_u16(),
                body = %String::from_utf8_lossy(truncated),
                "completion request failed"
            );
            return Err(GustError::Inference {
                backend,
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                GustError::Timeout(start.elapsed().as_millis() as u64)
            } else {
                GustError::Request(e)
            }
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(GustError::Inference {
                backend,
                message: format!("response too large: {} bytes", bytes.len()),
            });
        }

        let completion: ChatCompletion = serde_json::from_slice(&bytes)
            .map_err(|e| GustError::SchemaParse(format!("failed to parse completion: {e}")))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GustError::Inference {
                backend,
                message: "empty response".to_string(),
            })?;

        tracing::debug!(
            %backend,
            model,
            latency_ms = start.elapsed().as_millis() as u64,
            "completion received"
        );

        Ok(text)
    }
}
