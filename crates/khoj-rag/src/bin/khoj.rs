//! Command-line front end for the khoj-rag engine.
//!
//! Exit codes: 0 success, 1 generic failure, 2 migration required,
//! 3 read-only violation, 4 configuration/validation failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use khoj_rag::client::{RagClient, RebuildMode, SearchOptions};
use khoj_rag::config::RagConfig;
use khoj_rag::error::Error;
use khoj_rag::search::SearchType;
use khoj_rag::store::TableKind;

#[derive(Parser)]
#[command(name = "khoj", about = "Document RAG engine powered by LanceDB and Tantivy", version)]
struct Cli {
    /// Database directory (defaults to the configured data dir).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Open the database read-only.
    #[arg(long, global = true)]
    read_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty database.
    Init,
    /// Add a document from a file, directory, or URL.
    Add {
        source: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Search for chunks.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Restricted SQL WHERE filter over documents.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value = "hybrid")]
        mode: String,
        /// Context expansion radius (0 = no expansion).
        #[arg(long, default_value_t = 0)]
        expand_radius: usize,
    },
    /// List stored documents.
    List {
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a document by id.
    Get { id: String },
    /// Delete a document (cascades to its chunks).
    Delete { id: String },
    /// Rebuild the database.
    Rebuild {
        #[arg(long, default_value = "full")]
        mode: String,
    },
    /// Prune table version history.
    Vacuum {
        #[arg(long)]
        retention: Option<u64>,
    },
    /// Apply pending schema upgrades.
    Migrate,
    /// Show table version history.
    History {
        table: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::MigrationRequired(_) => ExitCode::from(2),
        Error::ReadOnly => ExitCode::from(3),
        Error::ConfigValidation(_) => ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("khoj_rag=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match RagConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::from(4);
            }
        },
        None => RagConfig::default(),
    };
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| config.storage.data_dir.join("khoj.lancedb"));

    match run(cli, config, db_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn run(cli: Cli, config: RagConfig, db_path: PathBuf) -> khoj_rag::Result<()> {
    let creates = matches!(cli.command, Command::Init | Command::Add { .. });
    let client = RagClient::builder(&db_path)
        .config(config)
        .create(creates)
        .read_only(cli.read_only)
        .skip_migration_check(matches!(cli.command, Command::Migrate))
        .build()
        .await?;

    let result = dispatch(&cli.command, &client).await;
    client.close().await;
    result
}

async fn dispatch(command: &Command, client: &RagClient) -> khoj_rag::Result<()> {
    match command {
        Command::Init => {
            println!("initialized database at {}", client.store().path().display());
        }
        Command::Add { source, title } => {
            let documents = client
                .create_document_from_source(source, title.as_deref(), None)
                .await?;
            for doc in &documents {
                println!(
                    "{}  {}",
                    doc.id.as_deref().unwrap_or("-"),
                    doc.title.as_deref().or(doc.uri.as_deref()).unwrap_or("-")
                );
            }
        }
        Command::Search {
            query,
            limit,
            filter,
            mode,
            expand_radius,
        } => {
            let search_type = SearchType::parse(mode)
                .ok_or_else(|| Error::InvalidInput(format!("unknown search mode '{mode}'")))?;
            let options = SearchOptions {
                limit: Some(*limit),
                search_type,
                filter: filter.clone(),
            };
            let mut results = client.search(query, &options).await?;
            if *expand_radius > 0 {
                results = client.expand_context(results, Some(*expand_radius)).await?;
            }
            let total = results.len();
            for (i, result) in results.iter().enumerate() {
                println!("{}\n", result.format_for_agent(Some(i + 1), Some(total)));
            }
        }
        Command::List { filter, limit } => {
            let documents = client.list_documents(*limit, None, filter.as_deref()).await?;
            for doc in &documents {
                println!(
                    "{}  {}  {}",
                    doc.id.as_deref().unwrap_or("-"),
                    doc.created_at.format("%Y-%m-%d"),
                    doc.title.as_deref().or(doc.uri.as_deref()).unwrap_or("-")
                );
            }
        }
        Command::Get { id } => {
            let doc = client
                .get_document_by_id(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("document {id}")))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Command::Delete { id } => {
            if client.delete_document(id).await? {
                println!("deleted {id}");
            } else {
                return Err(Error::NotFound(format!("document {id}")));
            }
        }
        Command::Rebuild { mode } => {
            let mode = RebuildMode::parse(mode)
                .ok_or_else(|| Error::InvalidInput(format!("unknown rebuild mode '{mode}'")))?;
            let processed = client.rebuild(mode).await?;
            println!("rebuilt {} documents", processed.len());
        }
        Command::Vacuum { retention } => {
            client.vacuum(*retention).await?;
            println!("vacuum complete");
        }
        Command::Migrate => {
            let applied = client.migrate().await?;
            if applied.is_empty() {
                println!("no pending upgrades");
            } else {
                for description in &applied {
                    println!("applied: {description}");
                }
            }
        }
        Command::History { table, limit } => {
            let kinds: Vec<TableKind> = match table {
                Some(name) => vec![TableKind::from_name(name)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown table '{name}'")))?],
                None => TableKind::ALL.to_vec(),
            };
            for kind in kinds {
                let mut versions = client.store().list_versions(kind).await?;
                versions.sort_by_key(|v| std::cmp::Reverse(v.version));
                versions.truncate(*limit);
                println!("{}:", kind.name());
                for v in versions {
                    println!("  v{}  {}", v.version, v.timestamp.to_rfc3339());
                }
            }
        }
    }
    Ok(())
}
