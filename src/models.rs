//! Core data models used throughout Quarry.
//!
//! These types represent the documents, chunks, and results that flow through
//! the ingestion and query pipeline. Types that land in a persisted artifact
//! (index metadata, cache entries) derive serde; the rest stay plain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a document's text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Every page had a usable text layer.
    Direct,
    /// Every page went through OCR.
    Ocr,
    /// Some pages direct, some OCR.
    Mixed,
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionMethod::Direct => write!(f, "direct"),
            ExtractionMethod::Ocr => write!(f, "ocr"),
            ExtractionMethod::Mixed => write!(f, "mixed"),
        }
    }
}

/// An ingested source document, recorded in the index metadata artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub title: String,
    pub content_hash: String,
    pub method: ExtractionMethod,
    pub page_count: u32,
    pub chunk_count: u32,
    pub ingested_at: DateTime<Utc>,
}

/// A bounded slice of a document's extracted text, the unit of embedding.
///
/// `start`/`end` are char offsets into the concatenated document text;
/// `page_first`/`page_last` are the 1-based pages the slice overlaps.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub page_first: u32,
    pub page_last: u32,
}

/// Metadata row paired 1:1 with a vector slot in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub slot: u32,
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    pub page_first: u32,
    pub page_last: u32,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// A retrieval hit resolved back to human-readable content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub title: String,
    pub chunk_id: String,
    pub page_first: u32,
    pub page_last: u32,
    pub snippet: String,
    pub score: f32,
}

/// How the answer in a query result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    /// Grounded completion from the language model.
    Synthesized,
    /// Retrieval-only output; the model was unreachable, timed out, or
    /// synthesis was disabled for the request.
    Fallback,
    /// Nothing cleared the relevance threshold.
    NoMatches,
}

impl std::fmt::Display for AnswerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerMode::Synthesized => write!(f, "synthesized"),
            AnswerMode::Fallback => write!(f, "fallback"),
            AnswerMode::NoMatches => write!(f, "no_matches"),
        }
    }
}

/// A cached answer, one JSON file per fingerprint in the cache directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub question: String,
    pub answer: String,
    pub mode: AnswerMode,
    pub sources: Vec<SourceRef>,
    pub model: String,
    /// Unix seconds; entries age out against the TTL for their mode.
    pub created_at: i64,
}

/// The result of one query. Never persisted except via [`CacheEntry`].
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub mode: AnswerMode,
    pub sources: Vec<SourceRef>,
    pub cached: bool,
    pub elapsed_ms: u64,
}

/// Per-document failure recorded during ingestion.
#[derive(Debug, Clone)]
pub struct IngestFailure {
    pub path: String,
    pub error: String,
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub ingested: usize,
    pub unchanged: usize,
    pub failed: Vec<IngestFailure>,
    pub chunks: usize,
    pub pages: usize,
    pub aborted: bool,
    pub elapsed_ms: u64,
}
