//! # TDS Virtual Teaching Assistant (`tds-ta`)
//!
//! Answers student questions from scraped course content and forum posts.
//!
//! ## Usage
//!
//! ```bash
//! tds-ta --config ./config/tds.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tds-ta serve` | Start the HTTP API |
//! | `tds-ta ask "<question>"` | Answer one question and print the JSON answer |
//! | `tds-ta context "<question>"` | Print the assembled prompt without calling the LLM |
//! | `tds-ta status` | Show what was loaded from the data directory |
//!
//! The config file is optional. `HOST`, `PORT` and `DATA_DIR` override it,
//! and `OPENAI_API_KEY` enables the LLM.

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use tds_assistant::store::{ContentStore, StoreStatus};
use tds_assistant::{config, logging, models::Question, server};

/// TDS Virtual Teaching Assistant: answers course questions from scraped
/// course material and forum posts.
#[derive(Parser)]
#[command(name = "tds-ta", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "./config/tds.toml")]
    config: PathBuf,

    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server.
    Serve,

    /// Answer a single question and print the JSON answer.
    Ask {
        /// The question text.
        question: String,

        /// Screenshot to run through OCR alongside the question.
        #[arg(long)]
        image: Option<PathBuf>,
    },

    /// Print the prompt and candidate links built for a question.
    Context {
        /// The question text.
        question: String,
    },

    /// Show the content store status and document counts.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, cli.log_json)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask { question, image } => {
            let mut q = Question::new(question);
            if let Some(path) = image {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Failed to read image: {}", path.display()))?;
                q = q.with_image(base64::engine::general_purpose::STANDARD.encode(bytes));
            }

            let service = server::build_service(&cfg);
            let deadline = Instant::now() + Duration::from_secs(cfg.server.answer_timeout_secs);
            let answer = service.answer(&q, deadline).await?;
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
        Commands::Context { question } => {
            let service = server::build_service(&cfg);
            let assembled = service.assemble(&question, None);
            println!("{}", assembled.prompt);
            println!();
            println!("--- candidate links ---");
            for (i, link) in assembled.links.iter().enumerate() {
                println!("{}. {} ({})", i + 1, link.text, link.url);
            }
        }
        Commands::Status => {
            let store = ContentStore::load_or_empty(&cfg.data.dir);
            let (github, discourse) = store.counts();
            println!("data dir:        {}", cfg.data.dir.display());
            println!("status:          {}", store.status().label());
            match store.status() {
                StoreStatus::Partial(reason) | StoreStatus::Degraded(reason) => {
                    println!("reason:          {}", reason);
                }
                StoreStatus::Loaded => {}
            }
            println!("course content:  {}", github);
            println!("discourse posts: {}", discourse);
        }
    }

    Ok(())
}
