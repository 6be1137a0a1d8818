use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration. Every table rejects unknown keys so a typo in
/// the TOML fails at load instead of silently falling back to a default.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".quarry")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include: default_include_globs(),
            exclude: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.txt".to_string(),
        "**/*.md".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    /// A document whose total extracted text falls below this is rejected.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_true")]
    pub ocr_enabled: bool,
    /// A page whose direct text falls below this goes through OCR.
    #[serde(default = "default_ocr_trigger_chars")]
    pub ocr_trigger_chars: usize,
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
    #[serde(default = "default_ocr_dpi")]
    pub ocr_dpi: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
            ocr_enabled: true,
            ocr_trigger_chars: default_ocr_trigger_chars(),
            ocr_language: default_ocr_language(),
            ocr_dpi: default_ocr_dpi(),
        }
    }
}

fn default_min_text_chars() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_ocr_trigger_chars() -> usize {
    32
}
fn default_ocr_language() -> String {
    "eng".to_string()
}
fn default_ocr_dpi() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Chunks shorter than this are dropped unless they are the document's
    /// final chunk.
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_chunk_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// "ollama" or "hash" (deterministic offline provider).
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Embedding batches in flight at once during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Required for the hash provider; ignored by ollama, which reports its
    /// own dimension in the first response.
    #[serde(default)]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: default_embed_model(),
            base_url: default_base_url(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            dimensions: 0,
        }
    }
}

fn default_embed_provider() -> String {
    "ollama".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    2
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Hits scoring below this are discarded even if fewer than top_k remain.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Weight of the semantic score in the rerank blend; the remainder goes
    /// to lexical overlap with the query.
    #[serde(default = "default_rerank_alpha")]
    pub rerank_alpha: f32,
    /// Candidate pool fetched for reranking, as a multiple of top_k.
    #[serde(default = "default_rerank_pool_factor")]
    pub rerank_pool_factor: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            rerank_alpha: default_rerank_alpha(),
            rerank_pool_factor: default_rerank_pool_factor(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.25
}
fn default_rerank_alpha() -> f32 {
    0.85
}
fn default_rerank_pool_factor() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl_synthesized")]
    pub ttl_synthesized_secs: u64,
    #[serde(default = "default_ttl_fallback")]
    pub ttl_fallback_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_synthesized_secs: default_ttl_synthesized(),
            ttl_fallback_secs: default_ttl_fallback(),
        }
    }
}

fn default_cache_capacity() -> usize {
    100
}
fn default_ttl_synthesized() -> u64 {
    3600
}
fn default_ttl_fallback() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SynthesisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gen_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_gen_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_gen_model() -> String {
    "llama3.2".to_string()
}
fn default_temperature() -> f32 {
    0.1
}

impl Config {
    pub fn index_dir(&self) -> PathBuf {
        self.paths.data_dir.join("index")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.paths.data_dir.join("cache")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let c = &config.chunking;
    if c.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if c.chunk_overlap >= c.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }
    if c.min_chunk_chars > c.chunk_size {
        anyhow::bail!("chunking.min_chunk_chars must be <= chunking.chunk_size");
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "ollama" => {}
        "hash" => {
            if e.dimensions == 0 {
                anyhow::bail!("embedding.dimensions must be > 0 for the hash provider");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be ollama or hash.",
            other
        ),
    }
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if e.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be >= 1");
    }
    if e.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be >= 1");
    }

    let r = &config.retrieval;
    if r.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&r.min_score) {
        anyhow::bail!("retrieval.min_score must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&r.rerank_alpha) {
        anyhow::bail!("retrieval.rerank_alpha must be in [0.0, 1.0]");
    }
    if r.rerank_pool_factor == 0 {
        anyhow::bail!("retrieval.rerank_pool_factor must be >= 1");
    }

    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be >= 1");
    }

    let s = &config.synthesis;
    if s.timeout_secs == 0 {
        anyhow::bail!("synthesis.timeout_secs must be >= 1");
    }
    if !(0.0..=2.0).contains(&s.temperature) {
        anyhow::bail!("synthesis.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
