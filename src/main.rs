//! # Claims RAG CLI (`ragctl`)
//!
//! Command-line front end for the knowledge-base retrieval service.
//!
//! ## Usage
//!
//! ```bash
//! ragctl --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragctl query "<text>"` | Run one retrieval query and print ranked chunks |
//! | `ragctl status` | Show store counts, cache state, and last reload |
//! | `ragctl serve` | Start the debug HTTP server |
//! | `ragctl completions <shell>` | Print shell completions |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `claims_rag=info`).

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use claims_rag::config;
use claims_rag::rag::{build_service, QueryOptions};
use claims_rag::server;
use claims_rag_core::context::{citations, format_context_for_prompt};
use claims_rag_core::models::Filters;

/// Semantic search over the claims-support knowledge base.
#[derive(Parser)]
#[command(name = "ragctl", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a retrieval query.
    Query {
        /// Query text.
        text: String,

        /// Number of results (1-100).
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity in [0, 1].
        #[arg(long)]
        min_score: Option<f64>,

        /// Only documents in this category.
        #[arg(long)]
        category: Option<String>,

        /// Only documents tagged with this state (e.g. `VA`).
        #[arg(long)]
        state: Option<String>,

        /// Infer the state filter from the query text.
        #[arg(long)]
        infer_state: bool,

        /// Abort the whole query after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the prompt context block instead of a result table.
        #[arg(long, conflicts_with = "json")]
        context: bool,

        /// Print the raw JSON result.
        #[arg(long)]
        json: bool,
    },

    /// Show retrieval status.
    Status,

    /// Start the debug HTTP server on `[server].bind`.
    Serve,

    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("claims_rag=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "ragctl", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;
    let service = build_service(&cfg).await?;

    match cli.command {
        Commands::Query {
            text,
            top_k,
            min_score,
            category,
            state,
            infer_state,
            timeout_ms,
            context,
            json,
        } => {
            let mut opts = QueryOptions {
                top_k,
                min_score,
                filters: Filters {
                    category,
                    state,
                    ..Filters::default()
                },
                timeout: timeout_ms.map(Duration::from_millis),
                ..QueryOptions::default()
            };
            if infer_state {
                opts = opts.with_inferred_filters(&text);
            }

            let result = service.query(&text, opts).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if context {
                print!("{}", format_context_for_prompt(&result.items));
            } else if result.items.is_empty() {
                println!("No relevant results ({}ms).", result.took_ms);
            } else {
                for (item, cite) in result.items.iter().zip(citations(&result.items)) {
                    println!("{}  [{:?}]", cite, item.relevance);
                    println!("    {}", item.snippet.replace('\n', " "));
                    println!();
                }
                println!(
                    "{} result(s) in {}ms{}",
                    result.total_results,
                    result.took_ms,
                    if result.from_cache { " (cached)" } else { "" }
                );
            }
        }
        Commands::Status => {
            let status = service.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Serve => {
            server::run_server(service.clone(), &cfg.server.bind).await?;
            service.shutdown();
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
