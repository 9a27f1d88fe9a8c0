//! Breadth-first same-host crawl that collects per-page CRO signals.

use std::collections::{HashSet, VecDeque};
use std::sync::OnceLock;
use std::thread;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::controls::AuditControls;

/// Maximum button labels kept per page.
pub const MAX_BUTTONS_PER_PAGE: usize = 5;

/// Failure to obtain a usable page.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Seed could not be parsed as a URL.
    #[error("invalid seed url {url:?}: {source}")]
    InvalidSeed {
        /// Raw value supplied by the caller.
        url: String,
        /// Parser error.
        #[source]
        source: url::ParseError,
    },
    /// Seed parsed but is not an http(s) URL with a host.
    #[error("seed url {0} must be http(s) with a host")]
    UnsupportedSeed(String),
    /// Network or client failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success response.
    #[error("http status {0}")]
    Status(u16),
    /// Response was not HTML.
    #[error("not html (content-type {0})")]
    NotHtml(String),
}

/// Something that can return the HTML body at a URL.
pub trait PageSource {
    /// Fetches `url` and returns its body.
    fn fetch(&self, url: &Url) -> Result<String, CrawlError>;
}

/// `PageSource` backed by a blocking `reqwest` client.
pub struct HttpPageSource {
    client: Client,
}

impl HttpPageSource {
    /// Builds a client using the timeout, user agent and TLS settings in `controls`.
    pub fn new(controls: &AuditControls) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .user_agent(controls.user_agent())
            .timeout(controls.request_timeout())
            .danger_accept_invalid_certs(controls.accept_invalid_certs())
            .build()?;
        Ok(Self { client })
    }
}

impl PageSource for HttpPageSource {
    fn fetch(&self, url: &Url) -> Result<String, CrawlError> {
        let response = self.client.get(url.as_str()).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Status(status.as_u16()));
        }
        if let Some(kind) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            if !kind.contains("html") {
                return Err(CrawlError::NotHtml(kind.to_string()));
            }
        }
        Ok(response.text()?)
    }
}

/// Validates and normalizes a user-supplied seed URL.
///
/// Values without an `http` prefix get `https://` prepended. Fragments are dropped.
pub fn normalize_seed(raw: &str) -> Result<Url, CrawlError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.to_ascii_lowercase().starts_with("http") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&candidate).map_err(|source| CrawlError::InvalidSeed {
        url: raw.to_string(),
        source,
    })?;
    if !is_web_scheme(&url) || url.host_str().is_none() {
        return Err(CrawlError::UnsupportedSeed(url.to_string()));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Signals pulled out of one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSignals {
    /// Non-empty button labels in document order, at most [`MAX_BUTTONS_PER_PAGE`].
    pub buttons: Vec<String>,
    /// Number of `<form>` elements.
    pub forms: usize,
    /// Absolute http(s) links with fragments removed.
    pub links: Vec<Url>,
}

struct SignalSelectors {
    button: Selector,
    form: Selector,
    anchor: Selector,
}

fn selectors() -> &'static SignalSelectors {
    static SELECTORS: OnceLock<SignalSelectors> = OnceLock::new();
    SELECTORS.get_or_init(|| SignalSelectors {
        button: Selector::parse("button").expect("button selector"),
        form: Selector::parse("form").expect("form selector"),
        anchor: Selector::parse("a[href]").expect("anchor selector"),
    })
}

/// Extracts button labels, form count and outgoing links from `html`.
pub fn extract_signals(html: &str, base: &Url) -> PageSignals {
    let document = Html::parse_document(html);
    let selectors = selectors();
    let buttons = document
        .select(&selectors.button)
        .map(element_label)
        .filter(|label| !label.is_empty())
        .take(MAX_BUTTONS_PER_PAGE)
        .collect();
    let forms = document.select(&selectors.form).count();
    let links = document
        .select(&selectors.anchor)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(is_web_scheme)
        .map(|mut link| {
            link.set_fragment(None);
            link
        })
        .collect();
    PageSignals {
        buttons,
        forms,
        links,
    }
}

fn element_label(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_web_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// One successfully fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRecord {
    /// Page URL.
    pub url: Url,
    /// Up to five button labels.
    pub buttons: Vec<String>,
    /// Form count.
    pub forms: usize,
}

impl CrawlRecord {
    /// Renders `URL:<url> | BUTTONS:[..] | FORMS:<n>`.
    pub fn render(&self) -> String {
        format!(
            "URL:{} | BUTTONS:{:?} | FORMS:{}",
            self.url, self.buttons, self.forms
        )
    }
}

/// A page that was attempted but produced no record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPage {
    /// Page URL.
    pub url: String,
    /// Why it was dropped.
    pub reason: String,
}

/// Result of a crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Fetched pages in crawl order.
    pub records: Vec<CrawlRecord>,
    /// Attempted pages that failed.
    pub skipped: Vec<SkippedPage>,
}

impl CrawlReport {
    /// Newline-joined record lines; empty when nothing was fetched.
    pub fn render(&self) -> String {
        self.records
            .iter()
            .map(CrawlRecord::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of pages attempted.
    pub fn attempted(&self) -> usize {
        self.records.len() + self.skipped.len()
    }
}

/// Walks same-host links breadth first from `seed`.
///
/// The page budget counts attempted fetches and is at least one. Each URL is
/// fetched at most once. Fetch failures are recorded and never abort the walk.
pub fn crawl(source: &dyn PageSource, seed: &Url, controls: &AuditControls) -> CrawlReport {
    let budget = controls.max_pages().max(1);
    let host = seed.host_str().map(str::to_ascii_lowercase);
    let mut start = seed.clone();
    start.set_fragment(None);

    let mut seen = HashSet::from([start.to_string()]);
    let mut queue = VecDeque::from([start]);
    let mut report = CrawlReport::default();

    while let Some(url) = queue.pop_front() {
        if report.attempted() >= budget {
            break;
        }
        if report.attempted() > 0 && !controls.politeness_delay().is_zero() {
            thread::sleep(controls.politeness_delay());
        }
        match source.fetch(&url) {
            Ok(body) => {
                let signals = extract_signals(&body, &url);
                let mut queued = 0usize;
                for link in signals.links {
                    let same_host = link.host_str().map(str::to_ascii_lowercase) == host;
                    if same_host && seen.insert(link.to_string()) {
                        queue.push_back(link);
                        queued += 1;
                    }
                }
                debug!(url = %url, forms = signals.forms, queued, "page crawled");
                report.records.push(CrawlRecord {
                    url,
                    buttons: signals.buttons,
                    forms: signals.forms,
                });
            }
            Err(err) => {
                warn!(url = %url, error = %err, "page skipped");
                report.skipped.push(SkippedPage {
                    url: url.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    info!(
        seed = %seed,
        fetched = report.records.len(),
        skipped = report.skipped.len(),
        "crawl finished"
    );
    report
}
