//! Document listing command.

use anyhow::Result;

use crate::config::Config;
use crate::embed;
use crate::index::VectorIndex;
use crate::stats::format_relative;

/// Run the list command: print one row per indexed document.
pub fn run_list(config: &Config) -> Result<()> {
    let provider = embed::create_provider(&config.embedding)?;
    let index = VectorIndex::open(&config.index_dir(), provider.model())?;

    if index.document_count() == 0 {
        println!("No documents indexed. Run `quarry ingest <paths>` first.");
        return Ok(());
    }

    let mut documents: Vec<_> = index.documents().to_vec();
    documents.sort_by(|a, b| a.path.cmp(&b.path));

    println!(
        "  {:<14} {:<28} {:>5} {:>6}  {:<6}  {}",
        "ID", "TITLE", "PAGES", "CHUNKS", "METHOD", "INGESTED"
    );
    println!("  {}", "-".repeat(78));
    for doc in &documents {
        let id_short: String = doc.id.chars().take(12).collect();
        let title: String = if doc.title.chars().count() > 28 {
            let mut t: String = doc.title.chars().take(25).collect();
            t.push_str("...");
            t
        } else {
            doc.title.clone()
        };
        println!(
            "  {:<14} {:<28} {:>5} {:>6}  {:<6}  {}",
            id_short,
            title,
            doc.page_count,
            doc.chunk_count,
            doc.method.to_string(),
            format_relative(doc.ingested_at)
        );
    }
    println!();
    println!("  {} document(s)", documents.len());
    Ok(())
}
