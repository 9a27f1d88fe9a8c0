//! Text-generation backends used by the reasoning stage.

use anyhow::Result;

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// Trait implemented by concrete LLM providers.
pub trait LlmProvider {
    /// Generates a completion for `request` using `model`.
    fn generate(&self, model: &str, request: &ProviderRequest) -> Result<String>;
}

/// Request envelope shared by the various providers.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    /// Fully rendered user prompt.
    pub prompt: &'a str,
    /// Optional system instruction.
    pub system: Option<&'a str>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: usize,
}

fn error_body(resp: reqwest::blocking::Response) -> String {
    resp.text()
        .unwrap_or_else(|_| "<body unavailable>".to_string())
}
