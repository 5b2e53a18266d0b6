//! # kachat CLI
//!
//! The `kachat` binary drives the knowledge-chat core: database
//! initialization, organization bootstrap, local ingestion, asking, and
//! serving the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! kachat --config ./config/kachat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kachat init` | Create the SQLite database and run schema migrations |
//! | `kachat bootstrap-org` | Provision a company and its owner (idempotent) |
//! | `kachat add <path>` | Ingest a PDF or text file into the personal scope |
//! | `kachat add --url <url>` | Ingest a web page |
//! | `kachat sources` | List personal sources |
//! | `kachat delete <id> --yes` | Delete a source (and its blob) |
//! | `kachat ask "<question>"` | Ask against the personal scope |
//! | `kachat serve` | Start the HTTP API |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use kachat::blob::{LocalBlobStore, StderrProgress};
use kachat::ingest::Pipeline;
use kachat::threads::Session;
use kachat::{bootstrap, completion, config, db, migrate, server, store};

/// kachat — a scoped knowledge-chat core.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file.
#[derive(Parser)]
#[command(
    name = "kachat",
    about = "kachat — ingest documents and chat with your personal or team knowledge",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kachat.toml")]
    config: PathBuf,

    /// User id for local commands (add, sources, delete, ask).
    #[arg(long, global = true, default_value = "local")]
    uid: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Provision a company and its owner member transactionally.
    ///
    /// Re-running with the same ids updates rather than duplicates.
    BootstrapOrg {
        #[arg(long)]
        company_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        seat_limit: i64,
        #[arg(long)]
        owner_uid: String,
        #[arg(long)]
        owner_email: String,
        #[arg(long, default_value = "")]
        owner_name: String,
    },

    /// Ingest a document into the personal scope.
    ///
    /// Accepts a file path (PDF or text), a `--url`, or pasted `--text`.
    Add {
        /// Path to a .pdf/.txt/.md/.csv file.
        path: Option<PathBuf>,

        /// Fetch and ingest a web page instead of a file.
        #[arg(long, conflicts_with = "path")]
        url: Option<String>,

        /// Ingest pasted text instead of a file.
        #[arg(long, conflicts_with_all = ["path", "url"])]
        text: Option<String>,

        /// Source name for --text input.
        #[arg(long, default_value = "pasted.txt")]
        name: String,
    },

    /// List personal sources, newest first.
    Sources,

    /// Delete a personal source and its stored blob.
    Delete {
        /// Source id (see `kachat sources`).
        id: String,

        /// Confirm the deletion. Refused without this flag.
        #[arg(long)]
        yes: bool,
    },

    /// Ask a question against the personal scope.
    ///
    /// Continues the most recently updated personal thread unless
    /// `--new-chat` is given.
    Ask {
        question: String,

        /// Pin the answer to a single source id.
        #[arg(long)]
        source: Option<String>,

        /// Start a fresh thread for this question.
        #[arg(long)]
        new_chat: bool,
    },

    /// Start the HTTP API server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Database initialized at {}", config.db.path.display());
        }

        Commands::BootstrapOrg {
            company_id,
            name,
            seat_limit,
            owner_uid,
            owner_email,
            owner_name,
        } => {
            let pool = db::connect(&config).await?;
            let company = bootstrap::bootstrap_org(
                &pool,
                &bootstrap::OrgBootstrap {
                    company_id,
                    company_name: name,
                    seat_limit,
                    owner_uid,
                    owner_email,
                    owner_name,
                },
            )
            .await?;
            println!(
                "Company {} ({}) ready: {}/{} seats used",
                company.id, company.name, company.seat_count, company.seat_limit
            );
            pool.close().await;
        }

        Commands::Add { path, url, text, name } => {
            let pipeline = build_pipeline(&config).await?;
            let mut session = Session::new(cli.uid.as_str());
            resume_latest_thread(&pipeline, &mut session).await?;

            let source = if let Some(url) = url {
                pipeline.ingest_url(&mut session, &url).await?
            } else if let Some(text) = text {
                pipeline
                    .ingest_text(&mut session, &name, "text/plain", &text)
                    .await?
            } else if let Some(path) = path {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "upload".to_string());
                let is_pdf = path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("pdf"))
                    .unwrap_or(false);
                if is_pdf {
                    let bytes = std::fs::read(&path)?;
                    let source = pipeline
                        .ingest_pdf(&mut session, &file_name, &bytes, &StderrProgress)
                        .await?;
                    eprintln!();
                    source
                } else {
                    let content = std::fs::read_to_string(&path)?;
                    pipeline
                        .ingest_text(&mut session, &file_name, "", &content)
                        .await?
                }
            } else {
                anyhow::bail!("add requires a path, --url, or --text");
            };

            println!("added source {}", source.id);
            println!("  name: {}", source.name);
            if let Some(summary) = &source.summary {
                println!("  summary: {}", summary);
            }
            println!("  plans: {}", source.pricing_plans.len());
        }

        Commands::Sources => {
            let pipeline = build_pipeline(&config).await?;
            let ctx = store::ScopeContext::Personal {
                uid: cli.uid.clone(),
            };
            let sources = pipeline.store.list_sources(&ctx).await?;
            if sources.is_empty() {
                println!("No sources.");
            }
            for source in sources {
                println!(
                    "{}  [{}]  {}",
                    source.id,
                    source.source_type.as_str(),
                    source.name
                );
            }
        }

        Commands::Delete { id, yes } => {
            if !yes {
                anyhow::bail!("refusing to delete {} without --yes", id);
            }
            let pipeline = build_pipeline(&config).await?;
            let ctx = store::ScopeContext::Personal {
                uid: cli.uid.clone(),
            };
            pipeline.store.delete_source(&ctx, &id).await?;
            println!("deleted {}", id);
        }

        Commands::Ask {
            question,
            source,
            new_chat,
        } => {
            let pipeline = build_pipeline(&config).await?;
            let mut session = Session::new(cli.uid.as_str());
            if !new_chat {
                resume_latest_thread(&pipeline, &mut session).await?;
            }
            let reply = pipeline
                .ask(&mut session, &question, source.as_deref())
                .await?;
            println!("{}", reply.text);
        }

        Commands::Serve => {
            server::run_server(&config).await?;
        }
    }

    Ok(())
}

async fn build_pipeline(config: &config::Config) -> Result<Pipeline> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let blobs = Arc::new(LocalBlobStore::new(config.blob.root.clone()));
    let client = completion::http_client(config.model.timeout_secs)?;
    Ok(Pipeline::new(
        pool,
        blobs,
        config.model.clone(),
        config.knowledge.clone(),
        client,
    ))
}

/// CLI sessions are short-lived; continue the most recently updated
/// personal thread so consecutive commands share one conversation.
async fn resume_latest_thread(pipeline: &Pipeline, session: &mut Session) -> Result<()> {
    let threads = pipeline
        .threads
        .list_threads(&session.uid, &session.scope)
        .await?;
    if let Some(latest) = threads.first() {
        session.active_thread = Some(latest.id.clone());
    }
    Ok(())
}
