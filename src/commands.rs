//! CLI command implementations for `kbh`.
//!
//! Each `run_*` function prints human-readable output to stdout, or JSON
//! when `json` is set.

use anyhow::{Context, Result};
use kb_harness_core::corpus::{load_corpus_or_general, CorpusWarning};
use kb_harness_core::models::Passage;
use kb_harness_core::segment::Segmenter;
use std::path::Path;

use crate::chatbot::Chatbot;
use crate::config::Config;
use crate::source_fs::FsSource;

fn print_passages(passages: &[Passage]) {
    for (i, p) in passages.iter().enumerate() {
        println!(
            "{}. [{}] {} › {}",
            i + 1,
            p.metadata.kind.as_str(),
            p.metadata.source,
            p.metadata.section
        );
        for line in p.content.lines() {
            println!("    {}", line);
        }
        println!();
    }
}

/// Segment one file and print its passages.
pub fn run_segment(config: &Config, file: &Path, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let identifier = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let segmenter = Segmenter::new(config.chunking.splitter()?);
    let passages = segmenter.segment(&content, &identifier);

    if json {
        println!("{}", serde_json::to_string_pretty(&passages)?);
        return Ok(());
    }
    if passages.is_empty() {
        println!("No passages.");
        return Ok(());
    }
    print_passages(&passages);
    println!("{} passage(s) from {}", passages.len(), identifier);
    Ok(())
}

/// Load the configured knowledge directory and summarize the corpus.
pub async fn run_corpus(config: &Config, verbose: bool) -> Result<()> {
    let source = FsSource::new(&config.knowledge.dir);
    let segmenter = Segmenter::new(config.chunking.splitter()?);
    let corpus = load_corpus_or_general(&source, &segmenter, &config.knowledge.extension).await?;

    for warning in &corpus.warnings {
        match warning {
            CorpusWarning::NoMatchingFiles { location } => println!(
                "warning: no .{} files in {}",
                config.knowledge.extension, location
            ),
            CorpusWarning::SourceUnavailable { reason } => println!("warning: {}", reason),
        }
    }

    for file in &corpus.files {
        let count = corpus
            .passages
            .iter()
            .filter(|p| p.metadata.source == *file)
            .count();
        println!("  {:<32} {:>4} passage(s)", file, count);
    }
    println!(
        "{} file(s), {} passage(s) including general knowledge",
        corpus.files.len(),
        corpus.len()
    );

    if verbose {
        println!();
        print_passages(&corpus.passages);
    }
    Ok(())
}

/// Answer one query, building the index first if needed.
pub async fn run_search(config: &Config, query: &str, attach: bool, json: bool) -> Result<()> {
    let chatbot = Chatbot::from_config(config)?;
    if attach {
        chatbot.builder().attach_existing().await?;
    }
    let result = chatbot.search(query).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "type": result.tier,
                "results": result.results,
            }))?
        );
        return Ok(());
    }

    println!("tier: {}", result.tier.as_str());
    for (i, answer) in result.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} › {}",
            i + 1,
            answer.confidence,
            answer.source,
            answer.section
        );
        println!("    {}", answer.text.replace('\n', "\n    "));
    }
    Ok(())
}

/// Rebuild the configured index namespace.
pub async fn run_refresh(config: &Config) -> Result<()> {
    let chatbot = Chatbot::from_config(config)?;
    let handle = chatbot.refresh().await?;
    println!(
        "Refreshed {} namespace '{}': {} passage(s)",
        handle.backend(),
        handle.namespace(),
        handle.passage_count()
    );
    Ok(())
}
