//! # Quarry CLI (`quarry`)
//!
//! The `quarry` binary is the primary interface for Quarry. It provides
//! commands for workspace initialization, document ingestion, querying with
//! answer synthesis, and index and cache maintenance.
//!
//! ## Usage
//!
//! ```bash
//! quarry --config ./quarry.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `quarry init` | Write a starter config and seed empty artifacts |
//! | `quarry ingest <paths>` | Extract, chunk, embed, and index documents |
//! | `quarry query "<question>"` | Retrieve passages and synthesize an answer |
//! | `quarry stats` | Show index and cache statistics |
//! | `quarry list` | List indexed documents |
//! | `quarry prune` | Drop expired cache entries |
//!
//! ## Examples
//!
//! ```bash
//! # Set up a workspace in the current directory
//! quarry init
//!
//! # Ingest a folder of PDFs and notes
//! quarry ingest ./papers ./notes
//!
//! # Ask a question against the index
//! quarry query "What does the lease renewal clause say?"
//!
//! # Retrieval only, no language model involved
//! quarry query "lease renewal" --no-synthesis
//!
//! # Machine-readable output
//! quarry query "lease renewal" --json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use quarry::{config, ingest, init, list, query, stats};

/// Quarry — a local-first retrieval-augmented query engine for document
/// collections.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `quarry init` to write a commented starter config.
#[derive(Parser)]
#[command(
    name = "quarry",
    about = "Quarry — a local-first retrieval-augmented query engine for document collections",
    version,
    long_about = "Quarry ingests PDF and plain-text documents (with OCR fallback for scanned \
    pages), chunks and embeds them into a crash-safe file-backed vector index, and answers \
    questions by retrieving the most relevant passages and synthesizing a cited answer through \
    a local Ollama model. Works fully offline; degrades to retrieval-only output when the \
    model is unreachable."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./quarry.toml`. Missing file means built-in defaults;
    /// run `quarry init` to write a commented starter.
    #[arg(long, global = true, default_value = "./quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize a Quarry workspace.
    ///
    /// Writes a commented starter `quarry.toml` (unless one exists), creates
    /// the data directory, and seeds an empty index and cache. Idempotent —
    /// running it again is safe and never overwrites an existing config.
    Init,

    /// Ingest documents into the index.
    ///
    /// Extracts text (PDF text layer, OCR fallback for scanned pages, plain
    /// text otherwise), chunks it, embeds the chunks, and appends them to the
    /// index. Unchanged documents are skipped; changed ones are re-ingested
    /// atomically. A failing document is reported and skipped.
    Ingest {
        /// Files or directories to ingest. Directories are walked with the
        /// configured include/exclude globs; files named directly skip them.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Re-ingest even when content is unchanged, and reset an index
        /// whose artifacts are unreadable or were built by another model.
        #[arg(long)]
        force: bool,
    },

    /// Ask a question against the index.
    ///
    /// Embeds the question, retrieves the best-scoring passages, and
    /// synthesizes a cited answer through the configured Ollama model.
    /// Falls back to a formatted listing of the passages when the model is
    /// unreachable or times out. Answers are cached by fingerprint.
    Query {
        /// The question to answer.
        question: String,

        /// Number of passages to retrieve (defaults to retrieval.top_k).
        #[arg(long)]
        top_k: Option<usize>,

        /// Skip synthesis and return the retrieval-only listing.
        #[arg(long)]
        no_synthesis: bool,

        /// Print the full result as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },

    /// Show index and cache statistics.
    ///
    /// Document, chunk, and page counts, artifact sizes, the pinned
    /// embedding model, cache hit rate, and whether Ollama is reachable.
    Stats {
        /// Print the report as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },

    /// List indexed documents.
    ///
    /// One row per document: id, title, page and chunk counts, extraction
    /// method, and when it was ingested.
    List,

    /// Drop expired cache entries from disk.
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Init has to run before a config file exists.
    if let Commands::Init = cli.command {
        return init::run_init(&cli.config);
    }

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        config::Config::default()
    };

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Ingest { paths, force } => {
            ingest::run_ingest(&cfg, &paths, force).await?;
        }
        Commands::Query {
            question,
            top_k,
            no_synthesis,
            json,
        } => {
            query::run_query(&cfg, &question, top_k, no_synthesis, json).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::List => {
            list::run_list(&cfg)?;
        }
        Commands::Prune => {
            stats::run_prune(&cfg)?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays parseable; `RUST_LOG` overrides the
/// default `info` level.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
