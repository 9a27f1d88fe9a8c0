//! Text embedding backends used by the failed-idea memory.

pub mod gemini;
pub mod openai;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;

/// Turns text into a fixed-dimension dense vector.
pub trait Embedder {
    /// Embeds a single piece of text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

fn pause_before_retry(backend: &str, attempt: usize, reason: &dyn std::fmt::Display) {
    let delay = retry_backoff(attempt);
    tracing::warn!(
        backend,
        attempt,
        delay_ms = delay.as_millis() as u64,
        %reason,
        "retrying embedding request"
    );
    thread::sleep(delay);
}
