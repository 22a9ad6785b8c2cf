//! # Manual Assist CLI (`massist`)
//!
//! ## Usage
//!
//! ```bash
//! massist --config ./config/massist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `massist init` | Create the SQLite database and schema |
//! | `massist ingest <path>` | Add or replace manuals in the current index |
//! | `massist reindex <path>` | Rebuild the whole index in a new generation |
//! | `massist search "<query>"` | Show the passages a question would retrieve |
//! | `massist session new` | Start a conversation session |
//! | `massist session list` | List an owner's sessions |
//! | `massist session delete <id>` | Archive a session and purge its messages |
//! | `massist ask <session> "<question>"` | Answer a question within a session |
//! | `massist history <session>` | Show a session's messages, newest first |
//! | `massist stats` | Index and conversation statistics |
//! | `massist purge-archived` | Remove archived sessions past retention |

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use manual_assist::assistant::Assistant;
use manual_assist::config::{self, Config};
use manual_assist::extract;
use manual_assist::ingest::{IngestReport, SourceDocument};
use manual_assist::logging;
use manual_assist::migrate;
use manual_assist::stats::print_stats;
use manual_assist::telemetry;
use manual_assist_core::error::{IngestionError, RagError};

/// Manual Assist: answers maintenance questions from equipment manuals.
///
/// All commands read a TOML configuration file given by `--config`.
/// See `config/massist.example.toml` for every option.
#[derive(Parser)]
#[command(
    name = "massist",
    about = "Manual Assist — question answering over equipment manuals with conversational memory",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/massist.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema. Idempotent.
    Init,

    /// Ingest a file or directory of manuals (.txt, .md, .pdf) into the
    /// current index, replacing earlier versions of the same files.
    Ingest { path: PathBuf },

    /// Rebuild the index from a file or directory in a new generation.
    ///
    /// Queries keep using the previous generation until the new one is
    /// complete.
    Reindex { path: PathBuf },

    /// Show retrieved passages for a query without generating an answer.
    Search {
        query: String,

        /// Maximum number of passages.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Manage conversation sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Ask a question within a session.
    Ask {
        session: String,
        question: String,

        /// Maximum number of passages given to the model.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show a session's messages, newest first.
    History {
        session: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show index and conversation statistics.
    Stats,

    /// Remove archived sessions older than the retention period.
    PurgeArchived,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a new session.
    New {
        /// Owner id (defaults to `memory.default_owner`).
        #[arg(long)]
        owner: Option<String>,
    },
    /// List sessions of an owner, most recently active first.
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Archive a session and purge its messages.
    Delete { session: String },
}

/// Log backend detail, then hand the error to anyhow.
fn rag_error(e: RagError) -> anyhow::Error {
    if let Some(detail) = e.detail() {
        debug!(detail, "backend error detail");
    }
    let retryable = e.is_retryable();
    let err = anyhow::Error::new(e);
    if retryable {
        err.context("temporary failure, try again later")
    } else {
        err
    }
}

fn load_documents(path: &Path) -> Result<Vec<SourceDocument>> {
    let mut docs = Vec::new();
    for result in extract::load_path(path)? {
        match result {
            Ok(doc) => docs.push(doc),
            Err(e) => eprintln!("  ✗ {}", e),
        }
    }
    if docs.is_empty() {
        bail!("No supported manuals found at {}", path.display());
    }
    Ok(docs)
}

fn print_results(results: &[Result<IngestReport, IngestionError>]) -> usize {
    let mut ok = 0;
    for result in results {
        match result {
            Ok(report) => {
                ok += 1;
                let avg = report
                    .stats
                    .as_ref()
                    .map(|s| format!(", avg {:.0} chars", s.mean_chars))
                    .unwrap_or_default();
                println!(
                    "  ✓ {}: {} pages ({} kept), {} chunks{}",
                    report.source_id, report.pages_total, report.pages_kept, report.chunks, avg
                );
            }
            Err(e) => println!("  ✗ {}", e),
        }
    }
    ok
}

fn owner_or_default(owner: Option<String>, cfg: &Config) -> String {
    owner.unwrap_or_else(|| cfg.memory.default_owner.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    telemetry::describe();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let assistant = Assistant::open(&cfg).await?;
    let default_top_k = cfg.retrieval.top_k;

    match cli.command {
        Commands::Init => {}
        Commands::Ingest { path } => {
            let docs = load_documents(&path)?;
            let results = assistant.ingest(&docs).await.map_err(rag_error)?;
            let ok = print_results(&results);
            println!("Ingested {} of {} sources.", ok, results.len());
            if ok == 0 {
                bail!("No source was ingested");
            }
        }
        Commands::Reindex { path } => {
            let docs = load_documents(&path)?;
            let report = assistant.reindex(&docs).await.map_err(rag_error)?;
            print_results(&report.results);
            match report.published {
                Some(generation) => println!("Published index generation {}.", generation),
                None => bail!("No source was ingested; the current index is unchanged"),
            }
        }
        Commands::Search { query, top_k } => {
            let retrieval = assistant
                .retrieve(&query, top_k.unwrap_or(default_top_k))
                .await
                .map_err(rag_error)?;
            if retrieval.is_empty() {
                println!("No relevant passages found.");
            }
            for (i, sc) in retrieval.chunks().iter().enumerate() {
                let rerank = sc
                    .rerank_score
                    .map(|r| format!(" rerank {:.4}", r))
                    .unwrap_or_default();
                println!(
                    "{}. [{:.4}{}] {} (page {})",
                    i + 1,
                    sc.score,
                    rerank,
                    sc.chunk.source_id,
                    sc.chunk.page_number
                );
                let snippet: String = sc.chunk.text.chars().take(200).collect();
                println!("   {}", snippet.replace('\n', " "));
            }
        }
        Commands::Session { action } => match action {
            SessionAction::New { owner } => {
                let session = assistant
                    .create_session(&owner_or_default(owner, &cfg))
                    .await
                    .map_err(rag_error)?;
                println!("{}", session.session_id);
            }
            SessionAction::List { owner } => {
                let sessions = assistant
                    .list_sessions(&owner_or_default(owner, &cfg))
                    .await
                    .map_err(rag_error)?;
                for s in sessions {
                    println!(
                        "{}  {:<8}  {}",
                        s.session_id,
                        s.state.as_str(),
                        s.last_active_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            SessionAction::Delete { session } => {
                assistant
                    .delete_session(&session)
                    .await
                    .map_err(rag_error)?;
                println!("Session {} archived.", session);
            }
        },
        Commands::Ask {
            session,
            question,
            top_k,
        } => {
            let answer = assistant
                .answer(&session, &question, top_k.unwrap_or(default_top_k))
                .await
                .map_err(rag_error)?;
            println!("{}", answer.answer);
            if !answer.sources.is_empty() {
                println!();
                println!("Sources:");
                for source in &answer.sources {
                    println!("  - {}", source);
                }
            }
        }
        Commands::History { session, limit } => {
            let messages = assistant
                .history(&session, limit)
                .await
                .map_err(rag_error)?;
            for m in messages {
                println!(
                    "[{}] {}: {}",
                    m.created_at.format("%Y-%m-%d %H:%M:%S"),
                    m.role.label(),
                    m.content
                );
            }
        }
        Commands::Stats => {
            let stats = assistant.stats().await.map_err(rag_error)?;
            print_stats(&cfg, &stats);
        }
        Commands::PurgeArchived => {
            let purged = assistant.purge_archived().await.map_err(rag_error)?;
            println!("Purged {} archived session(s).", purged);
        }
    }

    assistant.close().await;
    Ok(())
}
