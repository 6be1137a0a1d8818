//! Query command: retrieval plus answer synthesis against the index.

use anyhow::Result;

use crate::config::Config;
use crate::engine::{QueryEngine, QueryOptions};
use crate::synthesize::page_range;

pub async fn run_query(
    config: &Config,
    question: &str,
    top_k: Option<usize>,
    no_synthesis: bool,
    json: bool,
) -> Result<()> {
    let engine = QueryEngine::open(config.clone())?;
    let options = QueryOptions {
        top_k,
        synthesis: if no_synthesis { Some(false) } else { None },
    };
    let result = engine.query(question, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("{}", result.answer);
    if !result.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in result.sources.iter().enumerate() {
            println!(
                "  {}. [{:.2}] {}, {}",
                i + 1,
                source.score,
                source.title,
                page_range(source.page_first, source.page_last)
            );
            println!("     \"{}\"", source.snippet);
        }
    }
    println!();
    println!(
        "mode: {}{}, {}ms",
        result.mode,
        if result.cached { " (cached)" } else { "" },
        result.elapsed_ms
    );
    Ok(())
}
