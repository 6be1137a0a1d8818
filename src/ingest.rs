//! Batch ingestion command.
//!
//! Resolves the CLI paths to a deterministic file list (directories are
//! walked with the configured include/exclude globs; explicitly named
//! files skip the globs), then feeds them to the engine one document at a
//! time. A document that fails is reported and skipped, never fatal to the
//! run. Ctrl-C is honored between documents: everything already flushed
//! stays ingested.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{Config, IngestConfig};
use crate::engine::{IngestOutcome, QueryEngine};
use crate::models::{IngestFailure, IngestReport};

pub async fn run_ingest(config: &Config, paths: &[PathBuf], force: bool) -> Result<()> {
    let engine = if force {
        QueryEngine::open_forced(config.clone())?
    } else {
        QueryEngine::open(config.clone())?
    };

    let files = collect_files(paths, &config.ingest)?;
    if files.is_empty() {
        println!("No files matched.");
        return Ok(());
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let started = Instant::now();
    let mut report = IngestReport::default();
    for path in &files {
        if interrupted.load(Ordering::SeqCst) {
            report.aborted = true;
            break;
        }
        match engine.ingest_document(path, force).await {
            Ok(IngestOutcome::Ingested { chunks, pages }) => {
                report.ingested += 1;
                report.chunks += chunks;
                report.pages += pages as usize;
            }
            Ok(IngestOutcome::Unchanged) => {
                report.unchanged += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "document failed");
                report.failed.push(IngestFailure {
                    path: path.display().to_string(),
                    error: format!("{:#}", e),
                });
            }
        }
    }
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    println!("ingest");
    println!("  files matched: {}", files.len());
    println!("  ingested:      {}", report.ingested);
    println!("  unchanged:     {}", report.unchanged);
    println!("  failed:        {}", report.failed.len());
    println!("  chunks:        {}", report.chunks);
    println!("  pages:         {}", report.pages);
    println!("  elapsed:       {:.1}s", report.elapsed_ms as f64 / 1000.0);
    for failure in &report.failed {
        println!("  failed: {} ({})", failure.path, failure.error);
    }
    if report.aborted {
        println!("interrupted; documents flushed so far are kept");
    } else {
        println!("ok");
    }
    Ok(())
}

/// Expand CLI paths into a sorted, de-duplicated file list. Directories
/// are walked and filtered by the configured globs against paths relative
/// to that directory; files named directly are taken as-is.
pub fn collect_files(paths: &[PathBuf], config: &IngestConfig) -> Result<Vec<PathBuf>> {
    let include = build_globset(&config.include)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude.clone());
    let exclude = build_globset(&excludes)?;

    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            bail!("Path does not exist: {}", path.display());
        }
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path) {
            let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            let rel_str = relative.to_string_lossy().to_string();
            if exclude.is_match(&rel_str) {
                continue;
            }
            if !include.is_match(&rel_str) {
                continue;
            }
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Bad glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
