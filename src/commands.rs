//! Command implementations for the `kyassist` binary.
//!
//! Each `run_*` function opens what it needs from the configuration, does
//! one thing, and prints a human-readable report to stdout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use kylin_assist::assistant::Assistant;
use kylin_assist::config::Config;
use kylin_assist::prompt::source_label;
use kylin_assist::system_info::{HostSystemInfo, SystemInfoProvider};

async fn open(config: &Config) -> Result<Assistant> {
    let assistant = Assistant::open(config).await?;
    for issue in assistant.issues() {
        tracing::info!("{}", issue);
    }
    Ok(assistant)
}

pub async fn run_add(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let assistant = open(config).await?;
    let summary = assistant.add_documents(paths).await;

    println!("add");
    for doc in &summary.succeeded {
        if doc.empty {
            println!("  empty      {} (no text, not added)", doc.path.display());
        } else if doc.unchanged {
            println!("  unchanged  {} ({} chunks)", doc.path.display(), doc.chunks);
        } else {
            println!("  added      {} ({} chunks)", doc.path.display(), doc.chunks);
        }
    }
    for failure in &summary.failed {
        println!(
            "  failed     {} [{}] {}",
            failure.path.display(),
            failure.kind,
            failure.message
        );
    }
    println!(
        "  succeeded: {}  failed: {}",
        summary.succeeded.len(),
        summary.failed.len()
    );

    if summary.succeeded.is_empty() && summary.failed.is_empty() {
        println!("  no supported documents found");
    }
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    question: &str,
    include_system_info: bool,
    json: bool,
) -> Result<()> {
    let assistant = open(config).await?;
    let result = assistant.query(question, include_system_info).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("{}", result.answer);
    if !result.relevant_docs.is_empty() {
        println!();
        println!("Sources:");
        for (i, doc) in result.relevant_docs.iter().enumerate() {
            println!(
                "{}. [{:.2}] {}",
                i + 1,
                doc.similarity,
                source_label(&doc.source_file)
            );
        }
    }
    if let Some(failure) = &result.failure {
        tracing::debug!(kind = %failure.kind, "{}", failure.message);
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f32>,
) -> Result<()> {
    let assistant = open(config).await?;
    let top_k = limit.unwrap_or(config.retrieval.top_k);
    let threshold = threshold.unwrap_or(config.retrieval.similarity_threshold);
    let results = assistant.search_with(query, top_k, threshold).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, scored) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} #{}",
            i + 1,
            scored.similarity,
            source_label(&scored.chunk.source_path),
            scored.chunk.sequence_index
        );
        println!("    source: {}", scored.chunk.source_path);
        println!(
            "    excerpt: \"{}\"",
            truncate(&scored.chunk.text.replace('\n', " "), 160).trim()
        );
        println!();
    }
    Ok(())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let assistant = open(config).await?;
    let stats = assistant.get_knowledge_base_stats().await?;
    let documents = assistant.documents().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Kylin Assist Knowledge Base");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.document_count);
    println!("  Chunks:      {}", stats.chunk_count);

    if !documents.is_empty() {
        println!();
        println!("  {:<48} {:>6}  {}", "DOCUMENT", "KIND", "INGESTED");
        println!("  {}", "-".repeat(72));
        for doc in &documents {
            println!(
                "  {:<48} {:>6}  {}",
                truncate(source_label(&doc.source_path), 48),
                doc.kind,
                format_ts_relative(doc.ingested_at)
            );
        }
    }
    println!();
    Ok(())
}

pub async fn run_remove(config: &Config, path: &Path) -> Result<()> {
    let assistant = open(config).await?;
    if assistant.remove_document(path).await? {
        println!("Removed {}", path.display());
    } else {
        println!("Not in knowledge base: {}", path.display());
    }
    Ok(())
}

pub async fn run_clear(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear the knowledge base without --yes");
    }
    let assistant = open(config).await?;
    assistant.clear_knowledge_base().await?;
    println!("Knowledge base cleared.");
    Ok(())
}

pub fn run_sysinfo(config: &Config, json: bool) -> Result<()> {
    let provider = HostSystemInfo::new(&config.system_info);
    let report = provider.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_context_text());
        match provider.sdk_path() {
            Some(path) => println!("SDK: {}", path.display()),
            None => println!("SDK: not found"),
        }
    }
    Ok(())
}

pub fn run_check(config: &Config, path: &Path) {
    println!("check");
    if path.exists() {
        println!("  config: {}", path.display());
    } else {
        println!("  config: {} (not found, using defaults)", path.display());
    }
    println!("  database: {}", config.db.path.display());
    println!("  embedding provider: {}", config.embedding.provider);
    println!("  llm provider: {}", config.llm.provider);

    let issues = config.issues();
    if issues.is_empty() {
        println!("  OK");
    } else {
        for issue in issues {
            println!("  warning: {}", issue);
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{} min ago", delta / 60),
        3600..=86_399 => format!("{} h ago", delta / 3600),
        86_400..=2_591_999 => format!("{} d ago", delta / 86_400),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("麒麟系统", 2), "麒麟…");
        assert_eq!(truncate("abc", 5), "abc");
    }

    #[test]
    fn old_timestamps_render_as_dates() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
