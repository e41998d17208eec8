//! # Knowledge-base chatbot CLI (`kbh`)
//!
//! ## Usage
//!
//! ```bash
//! kbh --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbh segment <file>` | Print the passages one markdown file produces |
//! | `kbh corpus` | Load the knowledge directory and summarize the corpus |
//! | `kbh search "<query>"` | Answer a query through the FAQ/general/fallback tiers |
//! | `kbh refresh` | Rebuild the vector index namespace |
//! | `kbh serve` | Start the HTTP server |
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=kb_harness=debug`) to change log verbosity.

use clap::{Parser, Subcommand};
use kb_harness::commands;
use kb_harness::config::{load_config, Config};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kbh",
    about = "Knowledge-base chatbot: tiered FAQ/general/fallback retrieval over markdown",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kb.toml`. When the file does not exist,
    /// built-in defaults are used with the knowledge base at `./docs`.
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment a single markdown file and print its passages.
    Segment {
        file: PathBuf,

        /// Print passages as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Load the knowledge directory and summarize the resulting corpus.
    Corpus {
        /// Also print every passage.
        #[arg(long, short)]
        verbose: bool,
    },

    /// Answer a query.
    ///
    /// Builds the index first unless `--attach` is given.
    Search {
        query: String,

        /// Search the namespace as it already exists instead of rebuilding it.
        /// Only meaningful for a remote index populated by `kbh refresh`.
        #[arg(long)]
        attach: bool,

        #[arg(long)]
        json: bool,
    },

    /// Rebuild the index namespace from the knowledge directory.
    Refresh,

    /// Start the HTTP server on `[server].bind`.
    Serve {
        /// Override the bind address.
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg = resolve_config(&cli.config)?;

    match cli.command {
        Commands::Segment { file, json } => {
            commands::run_segment(&cfg, &file, json)?;
        }
        Commands::Corpus { verbose } => {
            commands::run_corpus(&cfg, verbose).await?;
        }
        Commands::Search {
            query,
            attach,
            json,
        } => {
            commands::run_search(&cfg, &query, attach, json).await?;
        }
        Commands::Refresh => {
            commands::run_refresh(&cfg).await?;
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            kb_harness::server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
