use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{error_body, LlmProvider, ProviderRequest};

/// Google Gemini `generateContent` backend.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl GeminiProvider {
    /// Builds a client against `base_url` (e.g. `https://generativelanguage.googleapis.com/v1beta`).
    pub fn new(api_key: String, base_url: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Gemini API key");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url,
            model.trim().trim_start_matches("models/")
        )
    }
}

impl LlmProvider for GeminiProvider {
    fn generate(&self, model: &str, request: &ProviderRequest) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(self.api_key.trim()).context("invalid Gemini API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = GenerateRequest {
            system_instruction: request.system.map(|text| Content {
                role: None,
                parts: vec![Part { text }],
            }),
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: request.prompt,
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };
        let resp = self
            .client
            .post(self.endpoint(model))
            .headers(headers)
            .json(&body)
            .send()
            .context("failed to call Gemini generateContent")?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("Gemini returned {}: {}", status, error_body(resp));
        }
        let parsed: GenerateResponse = resp.json().context("failed to parse Gemini response")?;
        parsed.into_text()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String> {
        let text = self
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .next()
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            bail!("Gemini response missing candidate text");
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_config() {
        let body = GenerateRequest {
            system_instruction: None,
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: "hi" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.5,
                max_output_tokens: 64,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 64);
        assert!(json.get("systemInstruction").is_none());
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn concatenates_first_candidate_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"a,"},{"text":"b"}]}},{"content":{"parts":[{"text":"ignored"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.into_text().unwrap(), "a,b");
    }

    #[test]
    fn blocked_prompt_has_no_text() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(parsed.into_text().is_err());
    }

    #[test]
    fn endpoint_tolerates_models_prefix() {
        let provider = GeminiProvider::new(
            "k".into(),
            "https://generativelanguage.googleapis.com/v1beta/",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            provider.endpoint("models/gemini-2.5-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
