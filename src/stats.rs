//! Index and cache statistics command, plus cache pruning.
//!
//! Provides a quick summary of what's indexed: document and chunk counts,
//! artifact sizes, the pinned embedding model, and cache health. Used by
//! `quarry stats` to give confidence that ingestion and caching are working
//! as expected. Opens the artifacts directly rather than going through the
//! engine, so stats and prune keep working when Ollama is unreachable.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::embed;
use crate::index::VectorIndex;
use crate::synthesize;

/// Everything `quarry stats` reports, serializable for `--json`.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub data_dir: String,
    pub documents: usize,
    pub chunks: usize,
    pub pages: u64,
    pub model: String,
    pub dimensions: usize,
    pub vectors_bytes: u64,
    pub metadata_bytes: u64,
    pub last_ingest: Option<DateTime<Utc>>,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ollama_url: Option<String>,
    pub ollama_reachable: Option<bool>,
}

/// Run the stats command: inspect the artifacts and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let provider = embed::create_provider(&config.embedding)?;
    let index = VectorIndex::open(&config.index_dir(), provider.model())?;
    let cache = QueryCache::open(&config.cache_dir(), &config.cache)?;

    let (vectors_bytes, metadata_bytes) = index.artifact_sizes();
    let pages: u64 = index.documents().iter().map(|d| d.page_count as u64).sum();
    let last_ingest = index.documents().iter().map(|d| d.ingested_at).max();

    // Probe whichever daemon a query would actually hit.
    let ollama_url = if config.synthesis.enabled {
        Some(config.synthesis.base_url.clone())
    } else if config.embedding.provider == "ollama" {
        Some(config.embedding.base_url.clone())
    } else {
        None
    };
    let ollama_reachable = match &ollama_url {
        Some(url) => Some(synthesize::probe(url).await),
        None => None,
    };

    let report = StatsReport {
        data_dir: config.paths.data_dir.display().to_string(),
        documents: index.document_count(),
        chunks: index.entry_count(),
        pages,
        model: index.model().to_string(),
        dimensions: index.dims(),
        vectors_bytes,
        metadata_bytes,
        last_ingest,
        cache_entries: cache.entry_count(),
        cache_hits: cache.stats().hits,
        cache_misses: cache.stats().misses,
        ollama_url,
        ollama_reachable,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Quarry — Index Stats");
    println!("====================");
    println!();
    println!("  Data dir:    {}", report.data_dir);
    println!("  Documents:   {}", report.documents);
    println!("  Chunks:      {}", report.chunks);
    println!("  Pages:       {}", report.pages);
    if report.dimensions > 0 {
        println!("  Model:       {} ({} dims)", report.model, report.dimensions);
    } else {
        println!("  Model:       {}", report.model);
    }
    println!("  Vectors:     {}", format_bytes(report.vectors_bytes));
    println!("  Metadata:    {}", format_bytes(report.metadata_bytes));
    println!(
        "  Last ingest: {}",
        match report.last_ingest {
            Some(ts) => format_relative(ts),
            None => "never".to_string(),
        }
    );
    println!();
    println!(
        "  Cache:       {} entries, {} hits / {} lookups ({:.0}%)",
        report.cache_entries,
        report.cache_hits,
        report.cache_hits + report.cache_misses,
        cache.stats().hit_rate() * 100.0
    );
    if let (Some(url), Some(reachable)) = (&report.ollama_url, report.ollama_reachable) {
        println!(
            "  Ollama:      {} at {}",
            if reachable { "reachable" } else { "unreachable" },
            url
        );
    }
    println!();
    Ok(())
}

/// Run the prune command: drop expired cache entries from disk.
pub fn run_prune(config: &Config) -> Result<()> {
    let mut cache = QueryCache::open(&config.cache_dir(), &config.cache)?;
    let removed = cache.prune()?;
    println!("pruned {} expired cache entries", removed);
    Ok(())
}

// ============ Formatting helpers ============

/// Format a byte count as a human-readable string.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format a timestamp as a relative time string (e.g. "3h ago"). Future or
/// far-past timestamps fall back to a plain date.
pub(crate) fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(ts).num_seconds();
    match delta {
        d if d < 0 => ts.format("%Y-%m-%d %H:%M").to_string(),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{}m ago", d / 60),
        d if d < 86_400 => format!("{}h ago", d / 3600),
        d if d < 30 * 86_400 => format!("{}d ago", d / 86_400),
        _ => ts.format("%Y-%m-%d").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn bytes_scale_through_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn relative_times_pick_the_nearest_unit() {
        let now = Utc::now();
        assert_eq!(format_relative(now - Duration::seconds(5)), "just now");
        assert_eq!(format_relative(now - Duration::minutes(5)), "5m ago");
        assert_eq!(format_relative(now - Duration::hours(3)), "3h ago");
        assert_eq!(format_relative(now - Duration::days(2)), "2d ago");
    }

    #[test]
    fn distant_and_future_times_fall_back_to_dates() {
        let now = Utc::now();
        let old = format_relative(now - Duration::days(90));
        assert!(old.contains('-'), "expected a date, got {}", old);
        let future = format_relative(now + Duration::hours(2));
        assert!(future.contains(':'), "expected a timestamp, got {}", future);
    }
}
