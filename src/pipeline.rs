//! Fixed-order audit chain over one typed state record.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::controls::AuditControls;
use crate::crawler::{crawl, normalize_seed, CrawlError, CrawlReport, PageSource};
use crate::embedder::Embedder;
use crate::experiment::{load_ab_results, AbReport, NO_AB_TEXT};
use crate::funnel::{load_funnel, FunnelReport, NO_FUNNEL_TEXT};
use crate::memory::{MemoryError, MemoryLookup, MemoryRecord, MemoryStore, FAILED_OUTCOME};
use crate::reasoning::{render_prompt, Generation, PromptInputs, ReasoningEngine};
use crate::scorer::{score_with, EffortPolicy, KeywordEffort, ScoredTable};
use crate::table::TableError;

/// Caller-supplied inputs for one audit.
#[derive(Debug, Clone, Default)]
pub struct AuditRequest {
    /// Website to audit, as typed by the user.
    pub url: String,
    /// Target user archetype.
    pub persona: String,
    /// Optional funnel CSV.
    pub funnel_file: Option<PathBuf>,
    /// Optional A/B results CSV.
    pub ab_file: Option<PathBuf>,
}

/// Everything known about a run so far.
///
/// Each stage writes only its own fields, and only after it succeeds.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    /// Original request.
    pub request: AuditRequest,
    /// Page budget in force.
    pub max_pages: usize,
    /// Normalized seed URL.
    pub seed: Option<Url>,
    /// Per-page crawl outcome.
    pub crawl: Option<CrawlReport>,
    /// Rendered crawl signals (may be empty).
    pub raw_cro_data: Option<String>,
    /// Parsed funnel, when one was supplied.
    pub funnel: Option<FunnelReport>,
    /// Funnel prompt block.
    pub funnel_text: Option<String>,
    /// Parsed A/B results, when supplied.
    pub ab: Option<AbReport>,
    /// A/B prompt block.
    pub ab_text: Option<String>,
    /// Losing variant written to memory during this run.
    pub remembered: Option<MemoryRecord>,
    /// Failed ideas recalled for the prompt.
    pub memory: Option<MemoryLookup>,
    /// Memory prompt block.
    pub memory_text: Option<String>,
    /// Model call outcome, including failed attempts.
    pub generation: Option<Generation>,
    /// CSV returned by the model with fences removed (empty when every model failed).
    pub cro_csv: Option<String>,
    /// Narrative summary in report mode.
    pub cro_summary_md: Option<String>,
    /// Scored recommendations; `None` when the model produced nothing usable.
    pub final_table: Option<ScoredTable>,
}

impl PipelineState {
    fn new(request: AuditRequest, max_pages: usize) -> Self {
        Self {
            request,
            max_pages,
            ..Self::default()
        }
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Page fetch and signal extraction.
    Crawl,
    /// Funnel drop-off analysis.
    Funnel,
    /// A/B ingest and losing-variant capture.
    Experiment,
    /// Failed-idea recall.
    Memory,
    /// LLM call.
    Reasoning,
    /// Parse and prioritize.
    Score,
}

impl Stage {
    /// Every stage, in order.
    pub const ALL: [Stage; 6] = [
        Stage::Crawl,
        Stage::Funnel,
        Stage::Experiment,
        Stage::Memory,
        Stage::Reasoning,
        Stage::Score,
    ];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Crawl => "crawl",
            Stage::Funnel => "funnel",
            Stage::Experiment => "experiment",
            Stage::Memory => "memory",
            Stage::Reasoning => "reasoning",
            Stage::Score => "score",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    /// Seed URL rejected.
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    /// Funnel or A/B upload unreadable.
    #[error(transparent)]
    Table(#[from] TableError),
    /// Memory store unreadable.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A run that stopped early, with the state as of the last successful stage.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineAbort {
    /// Stage that failed.
    pub stage: Stage,
    /// What went wrong.
    #[source]
    pub source: StageError,
    /// State before the failing stage ran.
    pub partial: Box<PipelineState>,
}

/// Runs the audit stages over injected collaborators.
pub struct Pipeline {
    source: Box<dyn PageSource>,
    embedder: Box<dyn Embedder>,
    memory: MemoryStore,
    engine: ReasoningEngine,
    effort: Box<dyn EffortPolicy>,
    controls: AuditControls,
}

impl Pipeline {
    /// Assembles a pipeline with the keyword effort heuristic.
    pub fn new(
        source: Box<dyn PageSource>,
        embedder: Box<dyn Embedder>,
        memory: MemoryStore,
        engine: ReasoningEngine,
        controls: AuditControls,
    ) -> Self {
        Self {
            source,
            embedder,
            memory,
            engine,
            effort: Box::new(KeywordEffort::default()),
            controls,
        }
    }

    /// Replaces the effort heuristic.
    pub fn with_effort_policy(mut self, effort: Box<dyn EffortPolicy>) -> Self {
        self.effort = effort;
        self
    }

    /// Controls in force.
    pub fn controls(&self) -> &AuditControls {
        &self.controls
    }

    /// Runs every stage in order.
    ///
    /// Stops at the first fatal error and returns the partial state with it.
    pub fn run(&self, request: AuditRequest) -> Result<PipelineState, PipelineAbort> {
        let mut state = PipelineState::new(request, self.controls.max_pages());
        for stage in Stage::ALL {
            if let Err(source) = self.run_stage(stage, &mut state) {
                error!(%stage, error = %source, "audit aborted");
                return Err(PipelineAbort {
                    stage,
                    source,
                    partial: Box::new(state),
                });
            }
            info!(%stage, "stage complete");
        }
        Ok(state)
    }

    fn run_stage(&self, stage: Stage, state: &mut PipelineState) -> Result<(), StageError> {
        match stage {
            Stage::Crawl => self.crawl_stage(state),
            Stage::Funnel => self.funnel_stage(state),
            Stage::Experiment => self.experiment_stage(state),
            Stage::Memory => self.memory_stage(state),
            Stage::Reasoning => {
                self.reasoning_stage(state);
                Ok(())
            }
            Stage::Score => {
                self.score_stage(state);
                Ok(())
            }
        }
    }

    fn crawl_stage(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let seed = normalize_seed(&state.request.url)?;
        let report = crawl(self.source.as_ref(), &seed, &self.controls);
        state.raw_cro_data = Some(report.render());
        state.seed = Some(seed);
        state.crawl = Some(report);
        Ok(())
    }

    fn funnel_stage(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let Some(path) = state.request.funnel_file.as_deref() else {
            state.funnel_text = Some(NO_FUNNEL_TEXT.to_string());
            return Ok(());
        };
        let report = load_funnel(path)?;
        for skipped in &report.skipped {
            warn!(line = ?skipped.line, reason = %skipped.reason, "funnel row skipped");
        }
        state.funnel_text = Some(report.render());
        state.funnel = Some(report);
        Ok(())
    }

    fn experiment_stage(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let Some(path) = state.request.ab_file.as_deref() else {
            state.ab_text = Some(NO_AB_TEXT.to_string());
            return Ok(());
        };
        let report = load_ab_results(path)?;
        for skipped in &report.skipped {
            warn!(line = ?skipped.line, reason = %skipped.reason, "a/b row skipped");
        }
        if let Some(idea) = report.losing_idea() {
            match self
                .memory
                .store(self.embedder.as_ref(), &idea.issue, &idea.fix, FAILED_OUTCOME)
            {
                Ok(record) => {
                    info!(id = record.id, issue = %record.issue, "losing variant remembered");
                    state.remembered = Some(record);
                }
                Err(err) => warn!(error = %err, "could not remember losing variant"),
            }
        }
        state.ab_text = Some(report.render());
        state.ab = Some(report);
        Ok(())
    }

    fn memory_stage(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let query = memory_query(
            state.raw_cro_data.as_deref().unwrap_or_default(),
            self.controls.memory_query_chars(),
        );
        let lookup = self.memory.retrieve(
            self.embedder.as_ref(),
            query,
            self.controls.memory_top_k(),
        )?;
        state.memory_text = Some(lookup.render());
        state.memory = Some(lookup);
        Ok(())
    }

    fn reasoning_stage(&self, state: &mut PipelineState) {
        let prompt = render_prompt(&PromptInputs {
            persona: &state.request.persona,
            crawl_signals: state.raw_cro_data.as_deref().unwrap_or_default(),
            funnel_text: state.funnel_text.as_deref().unwrap_or(NO_FUNNEL_TEXT),
            ab_text: state.ab_text.as_deref().unwrap_or(NO_AB_TEXT),
            memory_text: state
                .memory_text
                .as_deref()
                .unwrap_or(crate::memory::NO_MEMORY_TEXT),
            mode: self.controls.output_mode(),
        });
        let generation = self.engine.generate(&prompt, self.controls.output_mode());
        state.cro_csv = Some(generation.csv.clone());
        state.cro_summary_md = generation.summary_md.clone();
        state.generation = Some(generation);
    }

    fn score_stage(&self, state: &mut PipelineState) {
        let csv = state.cro_csv.as_deref().unwrap_or_default();
        let table = score_with(csv, self.effort.as_ref());
        match &table {
            Some(table) => {
                for skipped in &table.skipped {
                    warn!(line = ?skipped.line, reason = %skipped.reason, "recommendation row skipped");
                }
                info!(rows = table.rows.len(), "recommendations scored");
            }
            None => warn!("model output produced no recommendations"),
        }
        state.final_table = table;
    }
}

/// First `max_chars` characters of the crawl text.
fn memory_query(raw: &str, max_chars: usize) -> &str {
    match raw.char_indices().nth(max_chars) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_query_respects_char_boundaries() {
        assert_eq!(memory_query("héllo", 2), "hé");
        assert_eq!(memory_query("abc", 500), "abc");
        assert_eq!(memory_query("", 3), "");
    }

    #[test]
    fn stages_display_in_order() {
        let names = Stage::ALL.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["crawl", "funnel", "experiment", "memory", "reasoning", "score"]
        );
    }
}
