//! Google Gemini `embedContent` client.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{is_retryable_error, pause_before_retry, should_retry, Embedder};

/// Blocking embeddings client for the Gemini generative-language API.
#[derive(Clone)]
pub struct GeminiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    max_retries: usize,
}

impl GeminiEmbedder {
    /// Builds a new Gemini embeddings client.
    ///
    /// # Arguments
    /// * `api_key` - Value for the `x-goog-api-key` header (usually `GEMINI_API_KEY`)
    /// * `base_url` - API root, e.g. `https://generativelanguage.googleapis.com/v1beta`
    /// * `model` - Embedding model id with or without the `models/` prefix
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Gemini API key");
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Gemini base URL must be an http(s) URL"
        );
        let model = model.trim().trim_start_matches("models/").to_string();
        anyhow::ensure!(!model.is_empty(), "missing Gemini embedding model name");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Gemini API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Gemini HTTP client")?;
        let endpoint = format!(
            "{}/models/{}:embedContent",
            base_url.trim_end_matches('/'),
            model
        );
        Ok(Self {
            client,
            endpoint,
            model,
            max_retries: max_retries.max(1),
        })
    }
}

impl Embedder for GeminiEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = format!("models/{}", self.model);
        let mut attempt = 0usize;
        loop {
            let request = EmbedContentRequest {
                model: &model,
                content: Content {
                    parts: [Part { text }],
                },
            };
            match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbedContentResponse = resp
                            .json()
                            .context("failed to parse Gemini embedding response")?;
                        anyhow::ensure!(
                            !parsed.embedding.values.is_empty(),
                            "Gemini returned an empty embedding"
                        );
                        return Ok(parsed.embedding.values);
                    }
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        pause_before_retry("gemini", attempt, &status);
                        continue;
                    }
                    anyhow::bail!("Gemini embedContent failed ({}): {}", status, body);
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        pause_before_retry("gemini", attempt, &err);
                        continue;
                    }
                    return Err(err).context("Gemini embedContent request failed");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct EmbedContentRequest<'a> {
    model: &'a str,
    content: Content<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: ContentEmbedding,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_matches_embed_content_shape() {
        let request = EmbedContentRequest {
            model: "models/text-embedding-004",
            content: Content {
                parts: [Part { text: "slow checkout" }],
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "model": "models/text-embedding-004",
                "content": {"parts": [{"text": "slow checkout"}]}
            })
        );
    }

    #[test]
    fn strips_models_prefix_when_building_endpoint() {
        let embedder = GeminiEmbedder::new(
            "key".into(),
            "https://generativelanguage.googleapis.com/v1beta/".into(),
            "models/embedding-001".into(),
            Duration::from_secs(5),
            2,
        )
        .expect("client");
        assert_eq!(
            embedder.endpoint,
            "https://generativelanguage.googleapis.com/v1beta/models/embedding-001:embedContent"
        );
    }

    #[test]
    fn parses_embedding_values() {
        let parsed: EmbedContentResponse =
            serde_json::from_str(r#"{"embedding":{"values":[0.25,-1.5]}}"#).unwrap();
        assert_eq!(parsed.embedding.values, vec![0.25, -1.5]);
    }
}
