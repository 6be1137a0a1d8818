//! Two-tier query cache: a bounded in-memory LRU in front of one JSON file
//! per entry under `<data_dir>/cache/`.
//!
//! Keys are fingerprints over the normalized question and the retrieval
//! parameters that shape the answer, so "What is X?" and "  what IS x  "
//! share an entry while a different `top_k` or model does not. Synthesized
//! answers live longer than fallback answers (the fallback is worth
//! retrying once the generator is back). Expired entries count as misses
//! and are deleted when touched; `prune` sweeps the rest.
//!
//! Cache failures are never query failures: disk problems degrade to a
//! miss with a warning. Hit/miss counters persist in `stats.json` so a
//! one-shot CLI invocation can still report a meaningful hit rate.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::CacheConfig;
use crate::models::{AnswerMode, CacheEntry};

const STATS_FILE: &str = "stats.json";

/// Everything that distinguishes one cached answer from another.
#[derive(Debug)]
pub struct FingerprintInputs<'a> {
    pub question: &'a str,
    pub embed_model: &'a str,
    pub gen_model: &'a str,
    pub top_k: usize,
    pub min_score: f32,
    pub rerank_alpha: f32,
    pub rerank_pool_factor: usize,
    pub synthesis: bool,
}

/// sha256 over the canonical JSON of the inputs. serde_json maps are
/// BTree-backed, so the key order is stable.
pub fn fingerprint(inputs: &FingerprintInputs) -> String {
    let canonical = serde_json::json!({
        "question": normalize_question(inputs.question),
        "embed_model": inputs.embed_model,
        "gen_model": inputs.gen_model,
        "top_k": inputs.top_k,
        "min_score": inputs.min_score,
        "rerank_alpha": inputs.rerank_alpha,
        "rerank_pool_factor": inputs.rerank_pool_factor,
        "synthesis": inputs.synthesis,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn normalize_question(question: &str) -> String {
    question
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct MemorySlot {
    entry: CacheEntry,
    last_used: u64,
}

pub struct QueryCache {
    dir: PathBuf,
    capacity: usize,
    ttl_synthesized: Duration,
    ttl_fallback: Duration,
    memory: HashMap<String, MemorySlot>,
    tick: u64,
    stats: CacheStats,
}

impl QueryCache {
    pub fn open(dir: &Path, config: &CacheConfig) -> Result<Self, std::io::Error> {
        fs::create_dir_all(dir)?;
        let stats = fs::read_to_string(dir.join(STATS_FILE))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Ok(Self {
            dir: dir.to_path_buf(),
            capacity: config.capacity.max(1),
            ttl_synthesized: Duration::from_secs(config.ttl_synthesized_secs),
            ttl_fallback: Duration::from_secs(config.ttl_fallback_secs),
            memory: HashMap::new(),
            tick: 0,
            stats,
        })
    }

    /// Fresh entry for the fingerprint, or `None`. A disk hit repopulates
    /// the memory tier; an expired entry is deleted and counts as a miss.
    pub fn get(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        self.tick += 1;

        if let Some(slot) = self.memory.get(fingerprint) {
            if self.is_fresh(&slot.entry) {
                let entry = slot.entry.clone();
                if let Some(slot) = self.memory.get_mut(fingerprint) {
                    slot.last_used = self.tick;
                }
                self.record(true);
                return Some(entry);
            }
            self.memory.remove(fingerprint);
            self.remove_file(fingerprint);
            self.record(false);
            return None;
        }

        match self.read_file(fingerprint) {
            Some(entry) if self.is_fresh(&entry) => {
                self.admit(fingerprint.to_string(), entry.clone());
                self.record(true);
                Some(entry)
            }
            Some(_) => {
                self.remove_file(fingerprint);
                self.record(false);
                None
            }
            None => {
                self.record(false);
                None
            }
        }
    }

    /// Store in both tiers. Disk trouble degrades to memory-only with a
    /// warning.
    pub fn put(&mut self, entry: CacheEntry) {
        self.tick += 1;
        let path = self.entry_path(&entry.fingerprint);
        if let Err(e) = write_json_atomic(&path, &entry) {
            warn!(path = %path.display(), error = %e, "failed to write cache entry");
        }
        self.admit(entry.fingerprint.clone(), entry);
    }

    /// Delete expired entries from disk (and any they shadow in memory).
    /// Returns how many files were removed.
    pub fn prune(&mut self) -> Result<usize, std::io::Error> {
        let mut removed = 0usize;
        for result in fs::read_dir(&self.dir)? {
            let path = result?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(STATS_FILE) {
                continue;
            }
            let keep = fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<CacheEntry>(&s).ok())
                .map(|entry| self.is_fresh(&entry))
                .unwrap_or(false);
            if !keep {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove cache entry");
                } else {
                    removed += 1;
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        self.memory.remove(stem);
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Entries on disk, the tier that survives across invocations.
    pub fn entry_count(&self) -> usize {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return 0;
        };
        dir.filter_map(|r| r.ok())
            .filter(|e| {
                let path = e.path();
                path.extension().and_then(|x| x.to_str()) == Some("json")
                    && path.file_name().and_then(|n| n.to_str()) != Some(STATS_FILE)
            })
            .count()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[cfg(test)]
    fn memory_len(&self) -> usize {
        self.memory.len()
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let ttl = match entry.mode {
            AnswerMode::Synthesized => self.ttl_synthesized,
            AnswerMode::Fallback => self.ttl_fallback,
            AnswerMode::NoMatches => Duration::ZERO,
        };
        let age = chrono::Utc::now().timestamp().saturating_sub(entry.created_at);
        age >= 0 && (age as u64) < ttl.as_secs()
    }

    fn admit(&mut self, fingerprint: String, entry: CacheEntry) {
        if !self.memory.contains_key(&fingerprint) && self.memory.len() >= self.capacity {
            let oldest = self
                .memory
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                self.memory.remove(&key);
            }
        }
        self.memory.insert(
            fingerprint,
            MemorySlot {
                entry,
                last_used: self.tick,
            },
        );
    }

    fn record(&mut self, hit: bool) {
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        let path = self.dir.join(STATS_FILE);
        if let Err(e) = write_json_atomic(&path, &self.stats) {
            warn!(error = %e, "failed to persist cache stats");
        }
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint))
    }

    fn read_file(&self, fingerprint: &str) -> Option<CacheEntry> {
        let path = self.entry_path(fingerprint);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "dropping unparseable cache entry");
                self.remove_file(fingerprint);
                None
            }
        }
    }

    fn remove_file(&self, fingerprint: &str) {
        let path = self.entry_path(fingerprint);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove cache entry");
            }
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
