//! # Kylin Assist CLI (`kyassist`)
//!
//! The `kyassist` binary is a terminal front end over [`kylin_assist::assistant::Assistant`].
//! It adds documents to the knowledge base, answers questions, and manages
//! the store.
//!
//! ## Usage
//!
//! ```bash
//! kyassist --config ./config/kyassist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kyassist add <paths..>` | Ingest files or directories into the knowledge base |
//! | `kyassist ask "<question>"` | Answer a question from the knowledge base |
//! | `kyassist search "<question>"` | Show the most similar passages without generating an answer |
//! | `kyassist stats` | Document and chunk counts |
//! | `kyassist remove <path>` | Forget one document |
//! | `kyassist clear --yes` | Empty the knowledge base |
//! | `kyassist sysinfo` | Print the host facts used as system context |
//! | `kyassist check` | Validate configuration and report degraded features |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest a directory of manuals
//! kyassist add ~/Documents/manuals
//!
//! # Ask with live system facts in the prompt
//! kyassist ask "为什么系统很卡？" --system-info
//!
//! # Machine-readable answer
//! kyassist ask "如何安装软件包？" --json
//! ```
//!
//! When the config file does not exist the built-in defaults are used.
//! Logs go to stderr; `RUST_LOG` overrides the `--verbose` level.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kylin_assist::config;

/// Answers questions from your own documents.
#[derive(Parser)]
#[command(
    name = "kyassist",
    about = "Local knowledge-base question answering for Kylin desktops",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/kyassist.toml")]
    config: PathBuf,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest documents into the knowledge base.
    ///
    /// Directories are walked recursively; only supported extensions
    /// (.pdf .md .txt .rst .doc .docx .html .htm) are picked up. Unchanged
    /// documents are skipped. A failing file does not stop the batch.
    Add {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a question from the knowledge base.
    ///
    /// Without a configured language model the most relevant excerpts are
    /// printed instead of a generated answer.
    Ask {
        /// The question.
        question: String,

        /// Include current system facts in the prompt.
        #[arg(long)]
        system_info: bool,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show the passages most similar to a question.
    Search {
        /// The question or keywords.
        query: String,

        /// Maximum number of passages (defaults to `retrieval.top_k`).
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity (defaults to `retrieval.similarity_threshold`).
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f32>,
    },
    /// Show knowledge base statistics.
    Stats,
    /// Remove one document and all of its chunks.
    Remove {
        /// Path of the document as it was added.
        path: PathBuf,
    },
    /// Delete every document from the knowledge base.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
    /// Print the host facts used as system context.
    Sysinfo {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and list degraded features.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kylin_assist=debug,kyassist=debug"
    } else {
        "kylin_assist=warn,kyassist=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::debug!(path = %cli.config.display(), "config file not found; using defaults");
        config::Config::minimal()
    };

    match cli.command {
        Commands::Add { paths } => commands::run_add(&cfg, &paths).await?,
        Commands::Ask {
            question,
            system_info,
            json,
        } => commands::run_ask(&cfg, &question, system_info, json).await?,
        Commands::Search {
            query,
            limit,
            threshold,
        } => commands::run_search(&cfg, &query, limit, threshold).await?,
        Commands::Stats => commands::run_stats(&cfg).await?,
        Commands::Remove { path } => commands::run_remove(&cfg, &path).await?,
        Commands::Clear { yes } => commands::run_clear(&cfg, yes).await?,
        Commands::Sysinfo { json } => commands::run_sysinfo(&cfg, json)?,
        Commands::Check => commands::run_check(&cfg, &cli.config),
    }

    Ok(())
}
