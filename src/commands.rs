use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::{Config, show_config};
use crate::index::Filters;
use crate::pipeline::{AnswerOptions, SharedPipeline, validate_question};
use crate::retrieval::{RetrievalRequest, RetrievalResult};

/// Record fields whose values are always strings, even when they look numeric
const STRING_FIELDS: &[&str] = &[
    "source_type",
    "document_id",
    "filename",
    "content",
    "file_type",
    "uploaded_at",
];

/// Characters of each result shown by `search`
const PREVIEW_CHARS: usize = 200;

/// Outcome of an `ingest` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub indexed: usize,
    pub failed: usize,
    pub chunks: usize,
}

/// Show the configuration, or write the defaults when no file exists yet
#[inline]
pub fn init_config(show: bool) -> Result<()> {
    if show {
        return show_config();
    }

    let config = Config::load_default().context("Failed to load configuration")?;
    let config_path = config.config_file_path();

    if config_path.exists() {
        println!(
            "Configuration already exists at {}",
            style(config_path.display()).cyan()
        );
        println!("Edit the file directly, or run 'docs-rag config --show' to review it.");
        return Ok(());
    }

    config.save().context("Failed to save configuration")?;
    println!("{}", style("✓ Default configuration written").green());
    println!("Configuration saved to: {}", style(config_path.display()).cyan());
    Ok(())
}

/// Ingest each file in turn. A file that fails is reported and skipped; the
/// index is saved once at the end.
#[inline]
pub async fn ingest_files(
    pipeline: &SharedPipeline,
    files: Vec<PathBuf>,
    persist: bool,
) -> Result<IngestSummary> {
    let bar = if console::user_attended_stderr() {
        ProgressBar::new(files.len() as u64).with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] Ingesting {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    } else {
        ProgressBar::hidden()
    };

    let mut summary = IngestSummary::default();

    for path in files {
        let filename = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        bar.set_message(filename.clone());

        match pipeline
            .ingest(path.clone(), filename.clone(), Map::new(), false)
            .await
        {
            Ok(report) => {
                summary.indexed += 1;
                summary.chunks += report.chunk_count;
                bar.println(format!(
                    "{} {} → {} ({} chunks, {} chars)",
                    style("✓").green(),
                    report.filename,
                    style(&report.document_id).cyan(),
                    report.chunk_count,
                    report.char_count
                ));
            }
            Err(e) => {
                summary.failed += 1;
                error!("Failed to ingest {}: {}", path.display(), e);
                bar.println(format!("{} {}: {}", style("✗").red(), filename, e));
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    if persist && summary.indexed > 0 {
        pipeline
            .save_index()
            .await
            .context("Failed to save index")?;
        info!("Index saved");
    } else if !persist {
        warn!("Index not saved (--no-save)");
    }

    println!(
        "Indexed {} file(s), {} chunk(s); {} failed",
        summary.indexed, summary.chunks, summary.failed
    );
    Ok(summary)
}

/// Answer a question and print the answer with its citations
#[inline]
pub async fn query(
    pipeline: &SharedPipeline,
    question: String,
    options: AnswerOptions,
    json: bool,
) -> Result<()> {
    validate_question(&question, options.k)?;

    let answer = pipeline.answer(question, options).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&answer).context("Failed to serialize answer")?
        );
        return Ok(());
    }

    if !answer.success {
        let error = answer.error.as_deref().unwrap_or("unknown error");
        if !answer.answer.is_empty() {
            println!("{}", answer.answer);
        }
        bail!("Query failed: {}", error);
    }

    println!("{}", answer.answer);

    if !answer.citations.is_empty() {
        println!();
        println!("{}", style("Sources:").bold().yellow());
        for citation in &answer.citations {
            println!(
                "  [{}] {} (chunk {}, score {:.3}) {}",
                citation.index,
                citation.filename,
                citation.chunk,
                citation.score,
                style(&citation.document_id).dim()
            );
        }
    }

    Ok(())
}

/// Print the passages most similar to `query` without generating an answer
#[inline]
pub async fn search(
    pipeline: &SharedPipeline,
    query: String,
    request: RetrievalRequest,
    json: bool,
) -> Result<()> {
    validate_question(&query, request.k)?;

    let results = pipeline.retrieve(query, request).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).context("Failed to serialize results")?
        );
        return Ok(());
    }

    if results.is_empty() {
        println!("No matching passages found.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }
    Ok(())
}

fn print_result(number: usize, result: &RetrievalResult) {
    let metadata = &result.metadata;
    println!(
        "{} {} (chunk {}/{}, score {:.3})",
        style(format!("[{}]", number)).bold(),
        metadata.filename,
        metadata.chunk_idx + 1,
        metadata.total_chunks,
        result.score
    );

    let preview: String = result.content.chars().take(PREVIEW_CHARS).collect();
    let ellipsis = if result.content.chars().count() > PREVIEW_CHARS {
        "…"
    } else {
        ""
    };
    println!("    {}{}", preview.replace('\n', " "), ellipsis);
    println!();
}

#[inline]
pub async fn list_documents(pipeline: &SharedPipeline) -> Result<()> {
    let documents = pipeline.list_documents().await;

    if documents.is_empty() {
        println!("No documents have been indexed yet.");
        println!("Use 'docs-rag ingest <file>' to add one.");
        return Ok(());
    }

    println!("Indexed Documents ({} total):", documents.len());
    println!();
    for document in &documents {
        println!("📄 {} (ID: {})", document.filename, document.document_id);
        println!(
            "   Chunks: {}  Characters: {}",
            document.chunks, document.char_count
        );
    }

    let status = pipeline.status().await;
    println!();
    println!("Total chunks: {}", status.document_count);
    Ok(())
}

#[inline]
pub async fn delete_document(pipeline: &SharedPipeline, document_id: &str) -> Result<()> {
    pipeline
        .delete_document(document_id)
        .await
        .with_context(|| format!("Cannot delete document {}", document_id))?;
    Ok(())
}

#[inline]
pub async fn show_status(pipeline: &SharedPipeline, config: &Config) -> Result<()> {
    let status = pipeline.status().await;

    println!("📊 Docs-RAG Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🔍 Index:");
    if status.ready {
        println!("   ✅ Ready ({} chunks indexed)", status.document_count);
    } else {
        println!("   💤 Empty - ingest documents to get started");
    }
    println!("   📁 Data: {}", config.data_dir().display());

    println!("🤖 Embeddings:");
    println!("   📋 Model: {}", status.embedding_model);
    println!("   🔢 Batch Size: {}", config.embedding.batch_size);

    println!("💬 Answer Generation:");
    if status.llm_available {
        println!("   ✅ {} via {}", config.generation.model, config.generation.base_url);
    } else {
        println!(
            "   ❌ No API key (set {})",
            config.generation.api_key_env
        );
    }

    println!("📎 Supported file types: {}", status.supported_types.join(", "));
    Ok(())
}

/// Parse `key=value` filter arguments. Values that parse as JSON numbers or
/// booleans are matched as such, except on string-valued record fields.
#[inline]
pub fn parse_filters(pairs: &[String]) -> Result<Filters> {
    let mut filters = Filters::new();

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid filter '{}': expected key=value", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid filter '{}': key cannot be empty", pair);
        }

        let value = if STRING_FIELDS.contains(&key) {
            Value::String(raw.to_string())
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
                _ => Value::String(raw.to_string()),
            }
        };
        filters.insert(key.to_string(), value);
    }

    Ok(filters)
}
