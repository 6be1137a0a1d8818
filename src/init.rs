//! Workspace initialization command.
//!
//! Writes a starter `quarry.toml` when none exists, creates the data
//! directory, and seeds an empty index and cache so the other commands have
//! artifacts to open.

use std::path::Path;

use anyhow::{Context, Result};

use crate::cache::QueryCache;
use crate::config;
use crate::embed;
use crate::index::VectorIndex;

/// Written on first init. Every key is commented out and set to its
/// built-in default, so uncommenting a line never changes behavior.
const STARTER_CONFIG: &str = r#"# Quarry configuration. Every key is optional and shown at its default.

[paths]
# data_dir = ".quarry"

[ingest]
# include = ["**/*.pdf", "**/*.txt", "**/*.md"]
# exclude = []

[extraction]
# min_text_chars = 64
# ocr_enabled = true
# ocr_trigger_chars = 32
# ocr_language = "eng"
# ocr_dpi = 300

[chunking]
# chunk_size = 1000
# chunk_overlap = 200
# min_chunk_chars = 50

[embedding]
# provider = "ollama"     # "hash" embeds offline, for tests and smoke runs
# model = "nomic-embed-text"
# base_url = "http://localhost:11434"
# batch_size = 32
# concurrency = 2
# timeout_secs = 30
# max_retries = 3
# dimensions = 0          # required (> 0) for the hash provider

[retrieval]
# top_k = 5
# min_score = 0.25
# rerank_alpha = 0.85
# rerank_pool_factor = 3

[cache]
# capacity = 100
# ttl_synthesized_secs = 3600
# ttl_fallback_secs = 300

[synthesis]
# enabled = true
# model = "llama3.2"
# base_url = "http://localhost:11434"
# timeout_secs = 30
# temperature = 0.1
"#;

pub fn run_init(config_path: &Path) -> Result<()> {
    let wrote = if config_path.exists() {
        false
    } else {
        std::fs::write(config_path, STARTER_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        true
    };

    let config = config::load_config(config_path)?;

    std::fs::create_dir_all(&config.paths.data_dir).with_context(|| {
        format!(
            "Failed to create data dir {}",
            config.paths.data_dir.display()
        )
    })?;
    let provider = embed::create_provider(&config.embedding)?;
    let index = VectorIndex::open(&config.index_dir(), provider.model())?;
    let cache = QueryCache::open(&config.cache_dir(), &config.cache)?;

    if wrote {
        println!("wrote {}", config_path.display());
    } else {
        println!("{} already exists, left as-is", config_path.display());
    }
    println!("init");
    println!("  data dir:  {}", config.paths.data_dir.display());
    println!(
        "  index:     {} document(s), {} chunk(s)",
        index.document_count(),
        index.entry_count()
    );
    println!("  cache:     {} entry(s)", cache.entry_count());
    println!("ok");
    Ok(())
}
