//! Prompt rendering and the ordered model-fallback call into the LLM.

use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use tracing::{info, warn};

use crate::providers::{LlmProvider, ProviderRequest};

/// Shape of the answer requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    /// Bare CSV rows only.
    #[default]
    Csv,
    /// Short markdown narrative followed by a fenced CSV block.
    Report,
}

/// Everything the prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    /// Target user archetype.
    pub persona: &'a str,
    /// Per-page crawl signals.
    pub crawl_signals: &'a str,
    /// Funnel table and drop-off insights.
    pub funnel_text: &'a str,
    /// A/B test summary.
    pub ab_text: &'a str,
    /// Previously failed ideas.
    pub memory_text: &'a str,
    /// Requested answer shape.
    pub mode: OutputMode,
}

const SYSTEM_PROMPT: &str =
    "You are a senior conversion-rate-optimization analyst. Follow the output contract exactly.";

const CSV_CONTRACT: &str = r#""URL","Issue","Evidence","Suggested Fix","Impact","Confidence"

RULES (VERY IMPORTANT):
- Confidence MUST be a decimal number between 0 and 1
- Use numeric values only (example: 0.72)
- Do NOT add words, symbols, or ranges
- Do NOT leave Confidence empty
- If unsure, use 0.5"#;

/// Renders the full analysis prompt.
pub fn render_prompt(inputs: &PromptInputs<'_>) -> String {
    let crawl_signals = if inputs.crawl_signals.trim().is_empty() {
        "No pages could be crawled."
    } else {
        inputs.crawl_signals
    };
    let mut prompt = String::new();
    prompt.push_str("Act as a Senior CRO AI Agent.\n\n");
    prompt.push_str(&format!("TARGET PERSONA:\n{}\n\n", inputs.persona));
    prompt.push_str(&format!("WEBSITE CRO SIGNALS:\n{crawl_signals}\n\n"));
    prompt.push_str(&format!("FUNNEL ANALYSIS:\n{}\n\n", inputs.funnel_text));
    prompt.push_str(&format!("A/B TEST RESULTS:\n{}\n\n", inputs.ab_text));
    prompt.push_str(&format!(
        "FAILED CRO IDEAS (avoid repeating these):\n{}\n\n",
        inputs.memory_text
    ));
    prompt.push_str(
        "TASK:\n- Identify conversion friction points\n- Explain the evidence briefly\n- Propose high-impact CRO fixes\n- Estimate expected impact\n\n",
    );
    match inputs.mode {
        OutputMode::Csv => {
            prompt.push_str("OUTPUT ONLY CSV (no markdown, no explanation, no extra text):\n");
        }
        OutputMode::Report => {
            prompt.push_str(
                "OUTPUT a short markdown summary (at most 150 words), then the recommendations as a single ```csv fenced block with this header:\n",
            );
        }
    }
    prompt.push_str(CSV_CONTRACT);
    prompt.push('\n');
    prompt
}

/// Delay strategy between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause after every failure.
    Fixed(Duration),
    /// `base * 2^(failures - 1)`, capped.
    Exponential {
        /// First delay.
        base: Duration,
        /// Upper bound.
        cap: Duration,
    },
}

impl Backoff {
    /// Delay to wait after the `failures`-th failure (1-based).
    pub fn delay(&self, failures: usize) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let shift = failures.saturating_sub(1).min(16) as u32;
                base.saturating_mul(1u32 << shift).min(cap)
            }
        }
    }
}

/// Ordered candidate models plus how hard to try each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Models tried in order.
    pub candidates: Vec<String>,
    /// Attempts per model before moving on (at least one).
    pub attempts_per_candidate: usize,
    /// Pause between failed attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// One attempt per candidate with a fixed one-second pause.
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            attempts_per_candidate: 1,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }

    /// Overrides the per-candidate attempt count.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts_per_candidate = attempts.max(1);
        self
    }

    /// Overrides the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Blocks the caller between retries; swapped for a recorder in tests.
pub trait Sleeper {
    /// Pauses for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeper.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// A failed generation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Model that failed.
    pub model: String,
    /// Error text.
    pub error: String,
}

/// What the engine got back from the model, if anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// CSV payload with code fences removed; empty when every candidate failed.
    pub csv: String,
    /// Narrative markdown (report mode only).
    pub summary_md: Option<String>,
    /// Model that produced the answer.
    pub model: Option<String>,
    /// Failed attempts in order.
    pub failures: Vec<AttemptFailure>,
}

impl Generation {
    /// True when no candidate produced text.
    pub fn is_exhausted(&self) -> bool {
        self.model.is_none()
    }
}

/// Calls the LLM through the retry policy and validates the text it returns.
pub struct ReasoningEngine {
    provider: Box<dyn LlmProvider>,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
    temperature: f32,
    max_tokens: usize,
}

impl ReasoningEngine {
    /// Creates an engine that sleeps on the real clock.
    pub fn new(provider: Box<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            sleeper: Box::new(ThreadSleeper),
            temperature: 0.2,
            max_tokens: 2048,
        }
    }

    /// Replaces the sleeper.
    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Overrides sampling temperature and completion length.
    pub fn with_sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens.max(1);
        self
    }

    /// Active retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `prompt` through each candidate until one returns non-empty text.
    ///
    /// Never fails: exhaustion yields a [`Generation`] with empty `csv` and no model.
    pub fn generate(&self, prompt: &str, mode: OutputMode) -> Generation {
        let request = ProviderRequest {
            prompt,
            system: Some(SYSTEM_PROMPT),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let attempts = self.policy.attempts_per_candidate.max(1);
        let total = self.policy.candidates.len() * attempts;
        let mut generation = Generation::default();

        for model in &self.policy.candidates {
            for attempt in 1..=attempts {
                let error = match self.provider.generate(model, &request) {
                    Ok(text) if !text.trim().is_empty() => {
                        let (csv, summary_md) = split_response(&text, mode);
                        info!(%model, attempt, "model answered");
                        generation.csv = csv;
                        generation.summary_md = summary_md;
                        generation.model = Some(model.clone());
                        return generation;
                    }
                    Ok(_) => "empty response".to_string(),
                    Err(err) => format!("{err:#}"),
                };
                warn!(%model, attempt, %error, "generation attempt failed");
                generation.failures.push(AttemptFailure {
                    model: model.clone(),
                    error,
                });
                if generation.failures.len() < total {
                    self.sleeper
                        .sleep(self.policy.backoff.delay(generation.failures.len()));
                }
            }
        }

        warn!(
            candidates = self.policy.candidates.len(),
            "all candidate models failed; continuing without recommendations"
        );
        generation
    }
}

/// Removes Markdown code-fence markers (```` ```csv ```` and ```` ``` ````).
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```csv", "")
        .replace("```CSV", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Splits model output into `(csv, summary)`.
///
/// In [`OutputMode::Report`] the first fenced block is the CSV and the text
/// around it is the summary; without a fence the whole text is CSV. A fence
/// that closes on its opening line is read inline, and an unterminated fence
/// runs to the end of the text.
pub fn split_response(text: &str, mode: OutputMode) -> (String, Option<String>) {
    if mode == OutputMode::Csv {
        return (strip_code_fences(text), None);
    }
    let Some(open) = text.find("```") else {
        return (strip_code_fences(text), None);
    };
    let after_marker = &text[open + 3..];
    let (csv, rest) = match after_marker.find("```") {
        Some(close) if !after_marker[..close].contains('\n') => {
            (&after_marker[..close], &after_marker[close + 3..])
        }
        _ => {
            let body_start = after_marker.find('\n').map_or(after_marker.len(), |idx| idx + 1);
            let body = &after_marker[body_start..];
            match body.find("```") {
                Some(close) => (&body[..close], &body[close + 3..]),
                None => (body, ""),
            }
        }
    };
    let summary = format!("{}\n{}", text[..open].trim(), rest.trim());
    let summary = summary.trim();
    (
        csv.trim().to_string(),
        (!summary.is_empty()).then(|| summary.to_string()),
    )
}
