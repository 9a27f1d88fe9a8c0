//! Audit tuning knobs and the command-line surface that produces them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, ValueEnum};

use crate::embedder::gemini::GeminiEmbedder;
use crate::embedder::openai::OpenAiEmbedder;
use crate::embedder::Embedder;
use crate::memory::DEFAULT_MEMORY_FILE;
use crate::providers::{AnthropicProvider, GeminiProvider, LlmProvider, OpenAiProvider};
use crate::reasoning::{Backoff, OutputMode, RetryPolicy};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; cro-agent/0.1)";

/// Tunable knobs that bound one audit run.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditControls {
    max_pages: usize,
    politeness_delay: Duration,
    request_timeout: Duration,
    user_agent: String,
    accept_invalid_certs: bool,
    memory_top_k: usize,
    memory_query_chars: usize,
    output_mode: OutputMode,
    temperature: f32,
    max_tokens: usize,
}

impl AuditControls {
    /// Page budget for the crawl (never below one).
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Time to wait between successive page fetches.
    pub fn politeness_delay(&self) -> Duration {
        self.politeness_delay
    }

    /// Per-request timeout for page fetches.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// User agent sent with page fetches.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Whether TLS certificate errors are ignored while crawling.
    pub fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }

    /// Number of failed ideas recalled from memory.
    pub fn memory_top_k(&self) -> usize {
        self.memory_top_k
    }

    /// Prefix of the crawl text used as the memory query.
    pub fn memory_query_chars(&self) -> usize {
        self.memory_query_chars
    }

    /// Requested answer shape.
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Sampling temperature for the model.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Completion token cap.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Overrides the page budget.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Overrides the delay between page fetches.
    pub fn with_politeness_delay(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }

    /// Overrides the memory recall size.
    pub fn with_memory_top_k(mut self, top_k: usize) -> Self {
        self.memory_top_k = top_k;
        self
    }

    /// Overrides the requested answer shape.
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }
}

impl Default for AuditControls {
    fn default() -> Self {
        Self {
            max_pages: 3,
            politeness_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_invalid_certs: false,
            memory_top_k: 3,
            memory_query_chars: 500,
            output_mode: OutputMode::Csv,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

/// Text-generation backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions.
    Openai,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini generateContent.
    Gemini,
}

impl ProviderKind {
    fn default_models(self) -> &'static str {
        match self {
            ProviderKind::Openai => "gpt-4o-mini,gpt-4o",
            ProviderKind::Anthropic => "claude-3-5-haiku-latest,claude-3-5-sonnet-latest",
            ProviderKind::Gemini => "gemini-2.5-flash,gemini-flash-latest",
        }
    }
}

/// Embedding backend for the failed-idea memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EmbeddingBackend {
    /// OpenAI `/embeddings`.
    Openai,
    /// Google Gemini `embedContent`.
    Gemini,
}

/// Delay strategy between failed model attempts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BackoffKind {
    /// Constant delay.
    Fixed,
    /// Doubling delay up to a cap.
    Exponential,
}

/// API credentials and endpoints shared by both binaries.
#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// OpenAI-compatible base URL
    #[arg(long, env = "CRO_AGENT_OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Gemini API base URL
    #[arg(
        long,
        env = "CRO_AGENT_GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub gemini_base_url: String,

    /// Seconds before an LLM or embedding request times out
    #[arg(long, env = "CRO_AGENT_API_TIMEOUT_SECS", default_value_t = 60)]
    pub api_timeout_secs: u64,
}

impl ApiArgs {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs.max(1))
    }
}

fn require_key(key: &Option<String>, var: &str) -> Result<String> {
    key.clone()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{var} must be set"))
}

/// Embedding options for the failed-idea memory.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Embedding backend
    #[arg(long, env = "CRO_AGENT_EMBEDDING_BACKEND", value_enum, default_value = "gemini")]
    pub embedding_backend: EmbeddingBackend,

    /// Embedding model (backend default when omitted)
    #[arg(long, env = "CRO_AGENT_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Requested vector size (OpenAI text-embedding-3 models only)
    #[arg(long, env = "CRO_AGENT_EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,

    /// Retries for transient embedding failures
    #[arg(long, env = "CRO_AGENT_EMBEDDING_RETRIES", default_value_t = 3)]
    pub embedding_retries: usize,
}

impl EmbeddingArgs {
    /// Builds the configured embedder.
    pub fn build_embedder(&self, api: &ApiArgs) -> Result<Box<dyn Embedder>> {
        match self.embedding_backend {
            EmbeddingBackend::Openai => Ok(Box::new(OpenAiEmbedder::new(
                require_key(&api.openai_api_key, "OPENAI_API_KEY")?,
                api.openai_base_url.clone(),
                self.model_or("text-embedding-3-small"),
                self.embedding_dimensions,
                api.timeout(),
                self.embedding_retries,
            )?)),
            EmbeddingBackend::Gemini => Ok(Box::new(GeminiEmbedder::new(
                require_key(&api.gemini_api_key, "GEMINI_API_KEY")?,
                api.gemini_base_url.clone(),
                self.model_or("embedding-001"),
                api.timeout(),
                self.embedding_retries,
            )?)),
        }
    }

    fn model_or(&self, fallback: &str) -> String {
        self.embedding_model
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Command-line interface of `cro-audit`.
#[derive(Parser, Debug, Clone)]
#[command(name = "cro-audit", about = "Audit a website for conversion-rate issues")]
pub struct AuditCli {
    /// Website to audit (https:// is assumed when no scheme is given)
    #[arg(long, env = "CRO_AGENT_URL")]
    pub url: String,

    /// Target user persona
    #[arg(long, env = "CRO_AGENT_PERSONA", default_value = "General")]
    pub persona: String,

    /// Funnel CSV with step_name and users columns
    #[arg(long, env = "CRO_AGENT_FUNNEL")]
    pub funnel: Option<PathBuf>,

    /// A/B test CSV with variant, conversions and users columns
    #[arg(long, env = "CRO_AGENT_AB_TEST")]
    pub ab_test: Option<PathBuf>,

    /// Maximum pages to crawl
    #[arg(long, env = "CRO_AGENT_MAX_PAGES", default_value_t = 3)]
    pub max_pages: usize,

    /// Milliseconds to wait between page fetches
    #[arg(long, env = "CRO_AGENT_POLITENESS_MS", default_value_t = 0)]
    pub politeness_ms: u64,

    /// Seconds before a page fetch times out
    #[arg(long, env = "CRO_AGENT_FETCH_TIMEOUT_SECS", default_value_t = 5)]
    pub fetch_timeout_secs: u64,

    /// User agent for page fetches
    #[arg(long, env = "CRO_AGENT_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Ignore TLS certificate errors while crawling
    #[arg(long, env = "CRO_AGENT_INSECURE", default_value_t = false)]
    pub insecure: bool,

    /// Failed-idea memory file
    #[arg(long, env = "CRO_AGENT_MEMORY_PATH", default_value = DEFAULT_MEMORY_FILE)]
    pub memory_path: PathBuf,

    /// Failed ideas recalled into the prompt
    #[arg(long, env = "CRO_AGENT_TOP_K", default_value_t = 3)]
    pub top_k: usize,

    /// LLM backend
    #[arg(long, env = "CRO_AGENT_LLM_PROVIDER", value_enum, default_value = "gemini")]
    pub llm_provider: ProviderKind,

    /// Candidate models in fallback order, comma separated (provider default when omitted)
    #[arg(long, env = "CRO_AGENT_MODELS")]
    pub models: Option<String>,

    /// Attempts per candidate model
    #[arg(long, env = "CRO_AGENT_ATTEMPTS_PER_MODEL", default_value_t = 1)]
    pub attempts_per_model: usize,

    /// Backoff between failed model attempts
    #[arg(long, env = "CRO_AGENT_BACKOFF", value_enum, default_value = "fixed")]
    pub backoff: BackoffKind,

    /// Base backoff delay in milliseconds
    #[arg(long, env = "CRO_AGENT_BACKOFF_MS", default_value_t = 1000)]
    pub backoff_ms: u64,

    /// Upper bound for exponential backoff in milliseconds
    #[arg(long, env = "CRO_AGENT_BACKOFF_CAP_MS", default_value_t = 30_000)]
    pub backoff_cap_ms: u64,

    /// Sampling temperature
    #[arg(long, env = "CRO_AGENT_TEMPERATURE", default_value_t = 0.2)]
    pub temperature: f32,

    /// Completion token cap
    #[arg(long, env = "CRO_AGENT_MAX_TOKENS", default_value_t = 2048)]
    pub max_tokens: usize,

    /// Answer shape requested from the model
    #[arg(long, env = "CRO_AGENT_MODE", value_enum, default_value = "csv")]
    pub mode: OutputMode,

    /// Where the scored recommendations CSV is written
    #[arg(long, env = "CRO_AGENT_OUTPUT", default_value = "cro_report.csv")]
    pub output: PathBuf,

    /// Where the narrative summary is written in report mode
    #[arg(long, env = "CRO_AGENT_SUMMARY")]
    pub summary: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "CRO_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// API credentials and endpoints.
    #[command(flatten)]
    pub api: ApiArgs,

    /// Memory embedding options.
    #[command(flatten)]
    pub embedding: EmbeddingArgs,
}

impl AuditCli {
    /// Converts the parsed CLI into `AuditControls`.
    pub fn build_controls(&self) -> AuditControls {
        AuditControls {
            max_pages: self.max_pages.max(1),
            politeness_delay: Duration::from_millis(self.politeness_ms),
            request_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            user_agent: self.user_agent.clone(),
            accept_invalid_certs: self.insecure,
            memory_top_k: self.top_k,
            output_mode: self.mode,
            temperature: self.temperature,
            max_tokens: self.max_tokens.max(1),
            ..AuditControls::default()
        }
    }

    /// Candidate models in fallback order.
    pub fn candidate_models(&self) -> Vec<String> {
        self.models
            .as_deref()
            .unwrap_or_else(|| self.llm_provider.default_models())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Retry policy for the reasoning stage.
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.backoff_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_ms)),
            },
        };
        RetryPolicy::new(self.candidate_models())
            .with_attempts(self.attempts_per_model)
            .with_backoff(backoff)
    }

    /// Builds the selected LLM provider.
    pub fn build_provider(&self) -> Result<Box<dyn LlmProvider>> {
        let api = &self.api;
        Ok(match self.llm_provider {
            ProviderKind::Openai => Box::new(OpenAiProvider::new(
                require_key(&api.openai_api_key, "OPENAI_API_KEY")?,
                &api.openai_base_url,
                api.timeout(),
            )?),
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new(
                require_key(&api.anthropic_api_key, "ANTHROPIC_API_KEY")?,
                api.timeout(),
            )?),
            ProviderKind::Gemini => Box::new(GeminiProvider::new(
                require_key(&api.gemini_api_key, "GEMINI_API_KEY")?,
                &api.gemini_base_url,
                api.timeout(),
            )?),
        })
    }

    /// Builds the embedder used by the memory stages.
    pub fn build_embedder(&self) -> Result<Box<dyn Embedder>> {
        self.embedding.build_embedder(&self.api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AuditCli {
        let mut argv = vec!["cro-audit", "--url", "shop.test"];
        argv.extend_from_slice(args);
        AuditCli::try_parse_from(argv).expect("cli parses")
    }

    #[test]
    fn defaults_follow_documented_values() {
        let cli = parse(&[]);
        let controls = cli.build_controls();
        assert_eq!(controls.max_pages(), 3);
        assert_eq!(controls.memory_top_k(), 3);
        assert_eq!(controls.memory_query_chars(), 500);
        assert_eq!(controls.output_mode(), OutputMode::Csv);
        assert_eq!(cli.persona, "General");
        assert_eq!(cli.output, PathBuf::from("cro_report.csv"));
        assert_eq!(cli.memory_path, PathBuf::from(DEFAULT_MEMORY_FILE));
        assert_eq!(
            cli.candidate_models(),
            vec!["gemini-2.5-flash", "gemini-flash-latest"]
        );
        assert_eq!(
            cli.retry_policy().backoff,
            Backoff::Fixed(Duration::from_secs(1))
        );
    }

    #[test]
    fn zero_pages_is_raised_to_one() {
        assert_eq!(parse(&["--max-pages", "0"]).build_controls().max_pages(), 1);
    }

    #[test]
    fn custom_models_and_exponential_backoff() {
        let cli = parse(&[
            "--llm-provider",
            "openai",
            "--models",
            " a, ,b ",
            "--attempts-per-model",
            "2",
            "--backoff",
            "exponential",
            "--backoff-ms",
            "200",
            "--backoff-cap-ms",
            "50",
        ]);
        let policy = cli.retry_policy();
        assert_eq!(policy.candidates, vec!["a", "b"]);
        assert_eq!(policy.attempts_per_candidate, 2);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(200),
                cap: Duration::from_millis(200),
            }
        );
    }

    #[test]
    fn provider_requires_its_key() {
        let mut cli = parse(&["--llm-provider", "anthropic"]);
        cli.api.anthropic_api_key = None;
        let err = cli.build_provider().err().expect("missing key");
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
