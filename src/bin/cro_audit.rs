use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cro_agent::telemetry::init_logging;
use cro_agent::{
    AuditCli, AuditRequest, HttpPageSource, MemoryStore, OutputMode, Pipeline, ReasoningEngine,
};

fn main() -> Result<()> {
    let cli = AuditCli::parse();
    init_logging(&cli.log_level)?;

    let controls = cli.build_controls();
    let provider = cli.build_provider()?;
    let embedder = cli.build_embedder()?;
    let engine = ReasoningEngine::new(provider, cli.retry_policy())
        .with_sampling(controls.temperature(), controls.max_tokens());
    let source = HttpPageSource::new(&controls).context("failed to build page fetcher")?;
    let memory = MemoryStore::open(&cli.memory_path);
    let pipeline = Pipeline::new(Box::new(source), embedder, memory, engine, controls);

    let request = AuditRequest {
        url: cli.url.clone(),
        persona: cli.persona.clone(),
        funnel_file: cli.funnel.clone(),
        ab_file: cli.ab_test.clone(),
    };
    let state = match pipeline.run(request) {
        Ok(state) => state,
        Err(abort) => {
            if let Some(crawl) = &abort.partial.crawl {
                warn!(
                    fetched = crawl.records.len(),
                    skipped = crawl.skipped.len(),
                    "partial crawl results discarded"
                );
            }
            return Err(abort.into());
        }
    };

    if let Some(generation) = &state.generation {
        for failure in &generation.failures {
            warn!(model = %failure.model, error = %failure.error, "model attempt failed");
        }
    }

    if pipeline.controls().output_mode() == OutputMode::Report {
        if let Some(summary) = &state.cro_summary_md {
            match &cli.summary {
                Some(path) => {
                    fs::write(path, summary)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), "summary written");
                }
                None => println!("{summary}\n"),
            }
        }
    }

    match &state.final_table {
        Some(table) => {
            let csv = table.to_csv_string()?;
            fs::write(&cli.output, &csv)
                .with_context(|| format!("failed to write {}", cli.output.display()))?;
            info!(
                path = %cli.output.display(),
                rows = table.rows.len(),
                skipped = table.skipped.len(),
                "report written"
            );
            print!("{csv}");
        }
        None => {
            warn!("no recommendations generated");
            println!("No recommendations generated.");
        }
    }
    Ok(())
}
