//! # Quarry
//!
//! A local-first retrieval-augmented query engine for document collections.
//!
//! Quarry ingests PDF and plain-text documents (with OCR fallback for
//! scanned pages), chunks and embeds them into a crash-safe file-backed
//! vector index, and answers questions by retrieving the most relevant
//! passages and synthesizing a cited answer through a local Ollama model.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Documents  │──▶│   Pipeline    │──▶│  Artifacts   │
//! │ PDF/TXT/MD │   │ Extract+Chunk │   │ vectors.bin  │
//! │   (+OCR)   │   │    +Embed     │   │ meta.jsonl   │
//! └────────────┘   └───────────────┘   └──────┬───────┘
//!                                             │
//!                             ┌───────────────┤
//!                             ▼               ▼
//!                      ┌──────────┐     ┌──────────┐
//!                      │  Query   │     │  Cache   │
//!                      │ +Ollama  │     │ TTL+LRU  │
//!                      └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! quarry init                    # write starter config, seed artifacts
//! quarry ingest ./papers         # extract, chunk, embed, index
//! quarry query "renewal terms?"  # retrieve + synthesize a cited answer
//! quarry stats                   # index and cache health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF/text extraction with OCR fallback |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embed`] | Embedding providers (Ollama, offline hash) |
//! | [`index`] | File-backed vector index with crash repair |
//! | [`retrieve`] | Threshold retrieval and reranking |
//! | [`synthesize`] | Ollama answer synthesis and fallback |
//! | [`cache`] | Two-tier TTL query cache |
//! | [`engine`] | Ingestion and query orchestration |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod embed;
pub mod engine;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod init;
pub mod list;
pub mod models;
pub mod query;
pub mod retrieve;
pub mod stats;
pub mod synthesize;
