use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use cro_agent::memory::{DEFAULT_MEMORY_FILE, FAILED_OUTCOME};
use cro_agent::telemetry::init_logging;
use cro_agent::{ApiArgs, EmbeddingArgs, MemoryLookup, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "cro-memory", about = "Inspect and edit the failed CRO idea memory")]
struct MemoryCli {
    /// Failed-idea memory file
    #[arg(long, env = "CRO_AGENT_MEMORY_PATH", default_value = DEFAULT_MEMORY_FILE)]
    memory_path: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "CRO_AGENT_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(flatten)]
    api: ApiArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the stored ideas nearest to a query
    Recall {
        /// Free-text query
        query: String,
        /// Number of ideas to return
        #[arg(long, default_value_t = 3)]
        top_k: usize,
    },
    /// Record an idea
    Remember {
        /// What was tried
        #[arg(long)]
        issue: String,
        /// The change that was made
        #[arg(long)]
        fix: String,
        /// Outcome label
        #[arg(long, default_value = FAILED_OUTCOME)]
        outcome: String,
    },
    /// Print every stored idea as JSON lines, without vectors
    List,
}

#[derive(Serialize)]
struct RecordView<'a> {
    id: u64,
    issue: &'a str,
    fix: &'a str,
    outcome: &'a str,
    recorded_epoch_ms: u64,
    dimensions: usize,
}

fn main() -> Result<()> {
    let cli = MemoryCli::parse();
    init_logging(&cli.log_level)?;
    let store = MemoryStore::open(&cli.memory_path);

    match &cli.command {
        Command::Recall { query, top_k } => {
            let embedder = cli.embedding.build_embedder(&cli.api)?;
            match store.retrieve(embedder.as_ref(), query, *top_k)? {
                MemoryLookup::Empty => println!("No past failed CRO ideas."),
                MemoryLookup::Hits(hits) => {
                    for hit in hits {
                        println!(
                            "{:.4}\t#{} {} | {} | {}",
                            hit.distance,
                            hit.record.id,
                            hit.record.issue,
                            hit.record.fix,
                            hit.record.outcome
                        );
                    }
                }
            }
        }
        Command::Remember {
            issue,
            fix,
            outcome,
        } => {
            let embedder = cli.embedding.build_embedder(&cli.api)?;
            let record = store.store(embedder.as_ref(), issue, fix, outcome)?;
            println!("remembered #{} in {}", record.id, store.path().display());
        }
        Command::List => {
            for record in store.records()? {
                let view = RecordView {
                    id: record.id,
                    issue: &record.issue,
                    fix: &record.fix,
                    outcome: &record.outcome,
                    recorded_epoch_ms: record.recorded_epoch_ms,
                    dimensions: record.embedding.len(),
                };
                println!("{}", serde_json::to_string(&view)?);
            }
        }
    }
    Ok(())
}
