//! The query engine: one struct owning the index, the cache, the embedding
//! provider and the answer generator, exposing the two operations the CLI
//! is built on.
//!
//! `ingest_document` is a per-document transaction: extract, chunk, embed,
//! then under one write guard delete the document's old rows, stage the new
//! ones and flush. Readers either see the old version or the new one.
//!
//! `query` walks a fixed path: fingerprint, cache check, embed, retrieve,
//! synthesize-or-fallback, cache write. Zero surviving passages short-
//! circuits to a no-matches answer that is never cached; a generator
//! failure of any kind becomes the fallback answer, never an error.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{self, FingerprintInputs, QueryCache};
use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embed::{self, EmbeddingProvider};
use crate::extract::extract_document;
use crate::index::{IndexError, VectorIndex};
use crate::models::{
    AnswerMode, CacheEntry, Document, IndexEntry, QueryResult, SourceRef,
};
use crate::retrieve::{self, RetrievedPassage, SNIPPET_CHARS};
use crate::synthesize::{fallback_answer, AnswerGenerator, ContextPassage, OllamaGenerator};

pub const NO_MATCHES_ANSWER: &str =
    "No relevant content was found in the indexed documents for this question.";

/// Per-query overrides from the CLI.
#[derive(Debug, Default, Clone)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub synthesis: Option<bool>,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested { chunks: usize, pages: u32 },
    Unchanged,
}

pub struct QueryEngine {
    config: Config,
    index: RwLock<VectorIndex>,
    cache: Mutex<QueryCache>,
    provider: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn AnswerGenerator>,
}

impl QueryEngine {
    pub fn open(config: Config) -> Result<Self> {
        let provider = embed::create_provider(&config.embedding)?;
        let generator: Arc<dyn AnswerGenerator> = Arc::new(OllamaGenerator::new(
            &config.synthesis,
        )?);
        Self::with_components(config, provider, generator, false)
    }

    /// Like [`open`](Self::open), but structural index conflicts (embedding
    /// model changed, unreadable artifacts) reset the index instead of
    /// failing. Only ingestion with `--force` goes through here.
    pub fn open_forced(config: Config) -> Result<Self> {
        let provider = embed::create_provider(&config.embedding)?;
        let generator: Arc<dyn AnswerGenerator> = Arc::new(OllamaGenerator::new(
            &config.synthesis,
        )?);
        Self::with_components(config, provider, generator, true)
    }

    pub fn with_components(
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn AnswerGenerator>,
        reset_on_conflict: bool,
    ) -> Result<Self> {
        let index_dir = config.index_dir();
        let mut index = match VectorIndex::open(&index_dir, provider.model()) {
            Ok(index) => index,
            Err(
                e @ (IndexError::ModelChanged { .. }
                | IndexError::Version { .. }
                | IndexError::BadMagic { .. }),
            ) if reset_on_conflict => {
                warn!(error = %e, "resetting incompatible index artifacts");
                reset_index_dir(&index_dir)?;
                VectorIndex::open(&index_dir, provider.model())?
            }
            Err(e) => return Err(e.into()),
        };

        // The hash provider has a fixed dimension; catch a config change
        // before it poisons the artifact pair.
        let configured = provider.dimensions();
        if configured > 0 && index.dims() > 0 && configured != index.dims() {
            if !reset_on_conflict {
                bail!(
                    "index was built with dimension {} but the config now says {}; \
                     re-ingest with --force",
                    index.dims(),
                    configured
                );
            }
            warn!(
                indexed = index.dims(),
                configured, "embedding dimension changed; resetting index"
            );
            index.rebuild()?;
        }

        let cache = QueryCache::open(&config.cache_dir(), &config.cache)
            .with_context(|| "Failed to open query cache")?;

        Ok(Self {
            config,
            index: RwLock::new(index),
            cache: Mutex::new(cache),
            provider,
            generator,
        })
    }

    pub async fn document_count(&self) -> usize {
        self.index.read().await.document_count()
    }

    pub async fn entry_count(&self) -> usize {
        self.index.read().await.entry_count()
    }

    /// Ingest one file. Re-ingesting replaces the document's rows; matching
    /// content hashes are skipped unless `force`.
    pub async fn ingest_document(&self, path: &Path, force: bool) -> Result<IngestOutcome> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        };
        let document_id = document_id_for(path)?;

        {
            let index = self.index.read().await;
            if let Some(existing) = index.find_document(&document_id) {
                if !force && existing.content_hash == content_hash {
                    debug!(path = %path.display(), "content unchanged; skipping");
                    return Ok(IngestOutcome::Unchanged);
                }
            }
        }

        let extraction = extract_document(path, &bytes, &self.config.extraction).await?;
        let chunks = chunk_document(
            &document_id,
            &extraction.text,
            &extraction.spans,
            &self.config.chunking,
        );
        if chunks.is_empty() {
            bail!("{}: no chunks produced", path.display());
        }

        let embedded = embed::embed_in_batches(
            self.provider.clone(),
            &chunks,
            self.config.embedding.batch_size,
            self.config.embedding.concurrency,
        )
        .await?;

        let title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();
        let document = Document {
            id: document_id.clone(),
            path: path.display().to_string(),
            title,
            content_hash,
            method: extraction.method,
            page_count: extraction.page_count,
            chunk_count: chunks.len() as u32,
            ingested_at: chrono::Utc::now(),
        };

        let rows: Vec<(IndexEntry, Vec<f32>)> = chunks
            .iter()
            .zip(embedded)
            .map(|(chunk, (chunk_id, vector))| {
                debug_assert_eq!(chunk.id, chunk_id);
                let entry = IndexEntry {
                    slot: 0,
                    document_id: chunk.document_id.clone(),
                    chunk_id,
                    chunk_index: chunk.chunk_index,
                    page_first: chunk.page_first,
                    page_last: chunk.page_last,
                    start: chunk.start,
                    end: chunk.end,
                    text: chunk.text.clone(),
                };
                (entry, vector)
            })
            .collect();

        let chunk_count = rows.len();
        let pages = extraction.page_count;
        {
            let mut index = self.index.write().await;
            index.delete_by_document(&document_id)?;
            index.insert(document, rows)?;
            index.flush()?;
        }
        info!(path = %path.display(), chunks = chunk_count, pages, "ingested document");
        Ok(IngestOutcome::Ingested {
            chunks: chunk_count,
            pages,
        })
    }

    pub async fn query(&self, question: &str, opts: &QueryOptions) -> Result<QueryResult> {
        let started = Instant::now();
        if question.trim().is_empty() {
            bail!("Question is empty");
        }

        let mut params = self.config.retrieval.clone();
        if let Some(top_k) = opts.top_k {
            params.top_k = top_k.max(1);
        }
        let synthesis = opts.synthesis.unwrap_or(self.config.synthesis.enabled);

        let fingerprint = cache::fingerprint(&FingerprintInputs {
            question,
            embed_model: self.provider.model(),
            gen_model: self.generator.model(),
            top_k: params.top_k,
            min_score: params.min_score,
            rerank_alpha: params.rerank_alpha,
            rerank_pool_factor: params.rerank_pool_factor,
            synthesis,
        });

        if let Some(entry) = self.cache.lock().await.get(&fingerprint) {
            debug!(fingerprint = %fingerprint, "cache hit");
            return Ok(QueryResult {
                question: question.to_string(),
                answer: entry.answer,
                mode: entry.mode,
                sources: entry.sources,
                cached: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let query_vector = embed::embed_query(self.provider.as_ref(), question).await?;

        let (passages, titles) = {
            let index = self.index.read().await;
            let passages = retrieve::retrieve(&index, &query_vector, question, &params)?;
            let titles: Vec<String> = passages
                .iter()
                .map(|p| {
                    index
                        .find_document(&p.entry.document_id)
                        .map(|d| d.title.clone())
                        .unwrap_or_else(|| p.entry.document_id.clone())
                })
                .collect();
            (passages, titles)
        };

        if passages.is_empty() {
            return Ok(QueryResult {
                question: question.to_string(),
                answer: NO_MATCHES_ANSWER.to_string(),
                mode: AnswerMode::NoMatches,
                sources: Vec::new(),
                cached: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let context: Vec<ContextPassage> = passages
            .iter()
            .zip(&titles)
            .map(|(p, title)| ContextPassage {
                title: title.clone(),
                page_first: p.entry.page_first,
                page_last: p.entry.page_last,
                score: p.score,
                text: p.entry.text.clone(),
            })
            .collect();
        let sources = source_refs(&passages, &titles);

        let (answer, mode) = if synthesis {
            match self.generator.generate(question, &context).await {
                Ok(answer) => (answer, AnswerMode::Synthesized),
                Err(e) => {
                    warn!(error = %e, "synthesis failed; returning retrieved passages");
                    (fallback_answer(&context), AnswerMode::Fallback)
                }
            }
        } else {
            (fallback_answer(&context), AnswerMode::Fallback)
        };

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            question: question.to_string(),
            answer: answer.clone(),
            mode,
            sources: sources.clone(),
            model: self.generator.model().to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.cache.lock().await.put(entry);

        Ok(QueryResult {
            question: question.to_string(),
            answer,
            mode,
            sources,
            cached: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn source_refs(passages: &[RetrievedPassage], titles: &[String]) -> Vec<SourceRef> {
    passages
        .iter()
        .zip(titles)
        .map(|(p, title)| SourceRef {
            document_id: p.entry.document_id.clone(),
            title: title.clone(),
            chunk_id: p.entry.chunk_id.clone(),
            page_first: p.entry.page_first,
            page_last: p.entry.page_last,
            snippet: retrieve::snippet(&p.entry.text, SNIPPET_CHARS),
            score: p.score,
        })
        .collect()
}

/// Stable id derived from the canonical path, so re-ingesting the same
/// file replaces its rows.
fn document_id_for(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..16].to_string())
}

fn reset_index_dir(dir: &Path) -> Result<()> {
    for name in [crate::index::VECTORS_FILE, crate::index::META_FILE] {
        let path = dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::synthesize::SynthesisError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedGenerator {
        answer: &'static str,
        calls: AtomicUsize,
    }

    impl FixedGenerator {
        fn new(answer: &'static str) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AnswerGenerator for FixedGenerator {
        fn model(&self) -> &str {
            "fixed"
        }
        async fn generate(
            &self,
            _question: &str,
            _passages: &[ContextPassage],
        ) -> Result<String, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.to_string())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl AnswerGenerator for FailingGenerator {
        fn model(&self) -> &str {
            "failing"
        }
        async fn generate(
            &self,
            _question: &str,
            _passages: &[ContextPassage],
        ) -> Result<String, SynthesisError> {
            Err(SynthesisError::Timeout(Duration::from_secs(1)))
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.data_dir = dir.path().join("data");
        config.embedding.provider = "hash".to_string();
        config.embedding.model = "hash".to_string();
        config.embedding.dimensions = 64;
        config.chunking.chunk_size = 120;
        config.chunking.chunk_overlap = 20;
        config.chunking.min_chunk_chars = 10;
        config.extraction.min_text_chars = 10;
        config.retrieval.min_score = 0.0;
        config
    }

    fn engine_with(
        config: Config,
        generator: Arc<dyn AnswerGenerator>,
    ) -> QueryEngine {
        let provider = Arc::new(HashEmbedder::new(config.embedding.dimensions));
        QueryEngine::with_components(config, provider, generator, false).unwrap()
    }

    fn write_corpus_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let corpus = dir.path().join("corpus");
        std::fs::create_dir_all(&corpus).unwrap();
        let path = corpus.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const SOLAR: &str = "Solar panel efficiency improved again this year. \
        The efficiency of a typical solar panel now exceeds twenty percent \
        under standard test conditions, according to the laboratory report.";
    const BREAD: &str = "Sourdough bread needs a mature starter culture. \
        Keep the starter warm and feed it daily with equal parts flour and \
        water until it doubles reliably within a few hours.";

    #[tokio::test]
    async fn ingest_then_query_returns_sources() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), FixedGenerator::new("Grounded [1]."));
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);

        let outcome = engine.ingest_document(&path, false).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ingested { chunks, .. } if chunks > 0));

        let result = engine
            .query("solar panel efficiency", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.mode, AnswerMode::Synthesized);
        assert_eq!(result.answer, "Grounded [1].");
        assert!(!result.sources.is_empty());
        assert!(!result.cached);
        assert_eq!(result.sources[0].title, "solar");
    }

    #[tokio::test]
    async fn second_identical_query_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let generator = FixedGenerator::new("Answer [1].");
        let engine = engine_with(test_config(&dir), generator.clone());
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);
        engine.ingest_document(&path, false).await.unwrap();

        let first = engine
            .query("solar panel efficiency", &QueryOptions::default())
            .await
            .unwrap();
        let second = engine
            .query("  Solar PANEL efficiency ", &QueryOptions::default())
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.answer, second.answer);
        assert_eq!(first.sources.len(), second.sources.len());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unchanged_content_is_skipped_unless_forced() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), FixedGenerator::new("x"));
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);

        engine.ingest_document(&path, false).await.unwrap();
        let entries = engine.entry_count().await;

        let again = engine.ingest_document(&path, false).await.unwrap();
        assert_eq!(again, IngestOutcome::Unchanged);
        assert_eq!(engine.entry_count().await, entries);

        let forced = engine.ingest_document(&path, true).await.unwrap();
        assert!(matches!(forced, IngestOutcome::Ingested { .. }));
        assert_eq!(engine.entry_count().await, entries);
        assert_eq!(engine.document_count().await, 1);
    }

    #[tokio::test]
    async fn changed_content_replaces_the_old_rows() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), FixedGenerator::new("x"));
        let path = write_corpus_file(&dir, "doc.txt", SOLAR);
        engine.ingest_document(&path, false).await.unwrap();

        std::fs::write(&path, BREAD).unwrap();
        engine.ingest_document(&path, false).await.unwrap();
        assert_eq!(engine.document_count().await, 1);

        // Every retrievable passage now comes from the new text.
        let opts = QueryOptions {
            top_k: Some(10),
            synthesis: Some(false),
        };
        let result = engine.query("starter culture", &opts).await.unwrap();
        assert!(!result.sources.is_empty());
        for source in &result.sources {
            assert!(!source.snippet.contains("solar"));
        }
        assert!(result
            .sources
            .iter()
            .any(|s| s.snippet.contains("starter")));
    }

    #[tokio::test]
    async fn no_matches_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.retrieval.min_score = 0.95;
        let generator = FixedGenerator::new("x");
        let engine = engine_with(config, generator.clone());
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);
        engine.ingest_document(&path, false).await.unwrap();

        let result = engine
            .query("completely unrelated gibberish zzz", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.mode, AnswerMode::NoMatches);
        assert_eq!(result.answer, NO_MATCHES_ANSWER);
        assert!(result.sources.is_empty());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

        let again = engine
            .query("completely unrelated gibberish zzz", &QueryOptions::default())
            .await
            .unwrap();
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn generator_failure_becomes_fallback_with_the_same_sources() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), Arc::new(FailingGenerator));
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);
        engine.ingest_document(&path, false).await.unwrap();

        let result = engine
            .query("solar panel efficiency", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.mode, AnswerMode::Fallback);
        assert!(result.answer.contains("[1]"));
        assert!(result.answer.contains("solar panel"));
        assert!(!result.sources.is_empty());

        // The fallback is cached too, under its shorter TTL.
        let again = engine
            .query("solar panel efficiency", &QueryOptions::default())
            .await
            .unwrap();
        assert!(again.cached);
        assert_eq!(again.mode, AnswerMode::Fallback);
    }

    #[tokio::test]
    async fn synthesis_can_be_disabled_per_query() {
        let dir = TempDir::new().unwrap();
        let generator = FixedGenerator::new("never used");
        let engine = engine_with(test_config(&dir), generator.clone());
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);
        engine.ingest_document(&path, false).await.unwrap();

        let opts = QueryOptions {
            top_k: None,
            synthesis: Some(false),
        };
        let result = engine.query("solar panel efficiency", &opts).await.unwrap();
        assert_eq!(result.mode, AnswerMode::Fallback);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn top_k_override_limits_sources() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), FixedGenerator::new("x"));
        let path = write_corpus_file(&dir, "solar.txt", SOLAR);
        let other = write_corpus_file(&dir, "bread.txt", BREAD);
        engine.ingest_document(&path, false).await.unwrap();
        engine.ingest_document(&other, false).await.unwrap();

        let opts = QueryOptions {
            top_k: Some(1),
            synthesis: Some(false),
        };
        let result = engine.query("solar panel efficiency", &opts).await.unwrap();
        assert_eq!(result.sources.len(), 1);
    }

    #[tokio::test]
    async fn empty_question_is_an_error() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), FixedGenerator::new("x"));
        assert!(engine
            .query("   ", &QueryOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn on_topic_document_outranks_the_unrelated_one() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(test_config(&dir), FixedGenerator::new("x"));
        let solar = write_corpus_file(&dir, "solar.txt", SOLAR);
        let bread = write_corpus_file(&dir, "bread.txt", BREAD);
        engine.ingest_document(&solar, false).await.unwrap();
        engine.ingest_document(&bread, false).await.unwrap();

        let opts = QueryOptions {
            top_k: None,
            synthesis: Some(false),
        };
        let result = engine
            .query("solar panel efficiency under standard test conditions", &opts)
            .await
            .unwrap();
        assert!(!result.sources.is_empty());
        assert_eq!(result.sources[0].title, "solar");
    }

    #[tokio::test]
    async fn dimension_change_is_rejected_without_force() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let engine = engine_with(config.clone(), FixedGenerator::new("x"));
            let path = write_corpus_file(&dir, "solar.txt", SOLAR);
            engine.ingest_document(&path, false).await.unwrap();
        }
        let mut changed = config;
        changed.embedding.dimensions = 32;
        let provider = Arc::new(HashEmbedder::new(32));
        let err = QueryEngine::with_components(
            changed.clone(),
            provider.clone(),
            FixedGenerator::new("x"),
            false,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("--force"));

        let engine =
            QueryEngine::with_components(changed, provider, FixedGenerator::new("x"), true)
                .unwrap();
        assert_eq!(engine.entry_count().await, 0);
    }
}
