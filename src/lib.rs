#![warn(missing_docs)]
//! Core library entry points for the CRO audit pipeline.

pub mod controls;
pub mod crawler;
pub mod embedder;
pub mod experiment;
pub mod funnel;
pub mod memory;
pub mod pipeline;
pub mod providers;
pub mod reasoning;
pub mod scorer;
pub mod table;
pub mod telemetry;

pub use controls::{ApiArgs, AuditCli, AuditControls, EmbeddingArgs};
pub use crawler::{CrawlError, CrawlRecord, CrawlReport, HttpPageSource, PageSource};
pub use embedder::Embedder;
pub use experiment::{AbReport, AbVariant};
pub use funnel::{FunnelReport, FunnelRow};
pub use memory::{MemoryError, MemoryLookup, MemoryRecord, MemoryStore};
pub use pipeline::{AuditRequest, Pipeline, PipelineAbort, PipelineState, Stage};
pub use providers::LlmProvider;
pub use reasoning::{Backoff, OutputMode, ReasoningEngine, RetryPolicy, Sleeper};
pub use scorer::{Effort, EffortPolicy, Recommendation, ScoredTable};
pub use table::{SkippedRow, TableError};
