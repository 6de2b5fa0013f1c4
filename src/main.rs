use clap::{Parser, Subcommand};
use docs_rag::Result;
use docs_rag::commands::{
    delete_document, ingest_files, init_config, list_documents, parse_filters, query, search,
    show_status,
};
use docs_rag::config::Config;
use docs_rag::generation::PromptStyle;
use docs_rag::pipeline::{AnswerOptions, RagPipeline, SharedPipeline};
use docs_rag::retrieval::RetrievalRequest;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "docs-rag")]
#[command(about = "Retrieval-augmented question answering over local documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration, or show the current one
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Extract, chunk, embed and index one or more files
    Ingest {
        /// Files to index (.txt, .md, .docx, and .pdf when enabled)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Keep the new chunks in memory only
        #[arg(long)]
        no_save: bool,
    },
    /// Answer a question from the indexed documents
    Query {
        question: String,
        /// Number of passages to retrieve
        #[arg(short, long)]
        k: Option<usize>,
        /// Only use chunks whose metadata matches, e.g. --filter filename=notes.txt
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
        /// Answer style: default, summary or analysis
        #[arg(long, default_value = "default")]
        style: PromptStyle,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the passages most similar to a query, without generating an answer
    Search {
        query: String,
        /// Number of passages to return
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List indexed documents
    List,
    /// Delete an indexed document
    Delete {
        /// Document ID as shown by `list`
        document_id: String,
    },
    /// Show index and service status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Config { show } = cli.command {
        init_config(show)?;
        return Ok(());
    }

    let config = Config::load_default()?;
    let pipeline = SharedPipeline::new(RagPipeline::from_config(&config)?);

    match cli.command {
        Commands::Config { .. } => {}
        Commands::Ingest { files, no_save } => {
            ingest_files(&pipeline, files, !no_save).await?;
        }
        Commands::Query {
            question,
            k,
            filters,
            style,
            json,
        } => {
            let options = AnswerOptions {
                k,
                filters: parse_filters(&filters)?,
                style,
            };
            query(&pipeline, question, options, json).await?;
        }
        Commands::Search {
            query: text,
            k,
            filters,
            json,
        } => {
            let request = RetrievalRequest {
                k,
                filters: parse_filters(&filters)?,
                min_score: None,
            };
            search(&pipeline, text, request, json).await?;
        }
        Commands::List => {
            list_documents(&pipeline).await?;
        }
        Commands::Delete { document_id } => {
            delete_document(&pipeline, &document_id).await?;
        }
        Commands::Status => {
            show_status(&pipeline, &config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["docs-rag", "list"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::List));
        }
    }

    #[test]
    fn ingest_requires_files() {
        let cli = Cli::try_parse_from(["docs-rag", "ingest"]);
        assert!(cli.is_err());

        let cli = Cli::try_parse_from(["docs-rag", "ingest", "a.txt", "b.pdf", "--no-save"])
            .expect("ingest should parse");
        if let Commands::Ingest { files, no_save } = cli.command {
            assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("b.pdf")]);
            assert!(no_save);
        } else {
            panic!("expected ingest command");
        }
    }

    #[test]
    fn query_with_options() {
        let cli = Cli::try_parse_from([
            "docs-rag",
            "query",
            "What is ownership?",
            "-k",
            "6",
            "--filter",
            "filename=rust.txt",
            "--filter",
            "chunk_idx=0",
            "--style",
            "summary",
            "--json",
        ])
        .expect("query should parse");

        if let Commands::Query {
            question,
            k,
            filters,
            style,
            json,
        } = cli.command
        {
            assert_eq!(question, "What is ownership?");
            assert_eq!(k, Some(6));
            assert_eq!(filters, vec!["filename=rust.txt", "chunk_idx=0"]);
            assert_eq!(style, PromptStyle::Summary);
            assert!(json);
        } else {
            panic!("expected query command");
        }
    }

    #[test]
    fn query_defaults() {
        let cli = Cli::try_parse_from(["docs-rag", "query", "hello"]).expect("query should parse");

        if let Commands::Query {
            k, filters, style, json, ..
        } = cli.command
        {
            assert_eq!(k, None);
            assert!(filters.is_empty());
            assert_eq!(style, PromptStyle::Default);
            assert!(!json);
        } else {
            panic!("expected query command");
        }
    }

    #[test]
    fn unknown_style_is_rejected() {
        let cli = Cli::try_parse_from(["docs-rag", "query", "hello", "--style", "poem"]);
        assert!(cli.is_err());
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["docs-rag", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn delete_takes_document_id() {
        let cli = Cli::try_parse_from(["docs-rag", "delete", "abc12345"])
            .expect("delete should parse");
        assert!(matches!(
            cli.command,
            Commands::Delete { ref document_id } if document_id == "abc12345"
        ));
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["docs-rag", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["docs-rag", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
