// Configuration management module
// TOML settings under the base directory, plus a console summary of them

pub mod settings;


use std::fmt::Write;

use anyhow::{Context, Result};
use console::style;

pub use settings::{Config, ConfigError, EmbeddingConfig, EmbeddingProvider, HOME_ENV_VAR};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// Print the effective configuration for the default base directory
#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    eprint!("{}", render_config(&config));
    Ok(())
}

/// Human-readable summary of `config`, one setting per line
#[inline]
pub fn render_config(config: &Config) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_config(&mut out, config);
    out
}

fn write_config(out: &mut String, config: &Config) -> std::fmt::Result {
    writeln!(out, "{}", style("📋 Current Configuration").bold().cyan())?;
    writeln!(out)?;

    let embedding = &config.embedding;
    writeln!(out, "{}", style("Embedding Settings:").bold().yellow())?;
    writeln!(out, "  Provider: {}", style(format!("{:?}", embedding.provider)).cyan())?;
    match embedding.provider {
        EmbeddingProvider::Ollama => {
            match embedding.ollama_url() {
                Ok(url) => writeln!(out, "  Ollama URL: {}", style(url).cyan())?,
                Err(e) => writeln!(out, "  Ollama URL: {} ({})", style("Invalid").red(), e)?,
            }
            writeln!(out, "  Model: {}", style(&embedding.model).cyan())?;
        }
        EmbeddingProvider::Hashing => {}
    }
    writeln!(out, "  Dimension: {}", style(embedding.dimension).cyan())?;
    writeln!(out, "  Batch Size: {}", style(embedding.batch_size).cyan())?;

    writeln!(out)?;
    writeln!(out, "{}", style("Chunking:").bold().yellow())?;
    writeln!(out, "  Chunk Size: {}", style(config.chunking.chunk_size).cyan())?;
    writeln!(out, "  Overlap: {}", style(config.chunking.chunk_overlap).cyan())?;

    writeln!(out)?;
    writeln!(out, "{}", style("Retrieval:").bold().yellow())?;
    writeln!(out, "  Results (k): {}", style(config.retrieval.k).cyan())?;
    writeln!(
        out,
        "  Max Context Chars: {}",
        style(config.retrieval.max_context_chars).cyan()
    )?;
    writeln!(out, "  Min Score: {}", style(config.retrieval.min_score).cyan())?;

    writeln!(out)?;
    let generation = &config.generation;
    writeln!(out, "{}", style("Generation:").bold().yellow())?;
    writeln!(out, "  Endpoint: {}", style(&generation.base_url).cyan())?;
    writeln!(out, "  Model: {}", style(&generation.model).cyan())?;
    let key_status = if generation.api_key().is_some() {
        style("set".to_string()).green()
    } else {
        style("missing".to_string()).red()
    };
    writeln!(out, "  API Key (${}): {}", generation.api_key_env, key_status)?;

    writeln!(out)?;
    writeln!(out, "Config file: {}", style(config.config_file_path().display()).dim())?;
    writeln!(out, "Index data: {}", style(config.data_dir().display()).dim())?;

    Ok(())
}
