// ABOUTME: Entry point for the parley binary.
// ABOUTME: Loads configuration, initializes tracing and the storage engine, then runs one subcommand.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use parley_core::{LogRecord, MetadataFilter, Purpose};
use parley_store::{StorageEngine, StoreConfig};
use serde_json::{Value, json};

const DEFAULT_LOG_FILTER: &str = "parley=info,parley_store=info,parley_core=info";

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Durable storage for AI exchanges: JSONL logs with a rebuildable SQLite index")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage root (overrides PARLEY_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Project directory (overrides PARLEY_PROJECT_PATH)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store and print what rebuild and healing did
    Init,

    /// Query index metadata, newest first
    Query {
        /// Project id (defaults to the current project)
        #[arg(long)]
        project_id: Option<String>,

        /// Query across every project
        #[arg(long, conflicts_with = "project_id")]
        all_projects: bool,

        /// Purpose tag, e.g. CHAT or FILE_SUMMARY
        #[arg(long)]
        purpose: Option<String>,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Only exchanges after this RFC 3339 time
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// Only exchanges before this RFC 3339 time
        #[arg(long)]
        before: Option<DateTime<Utc>>,

        /// Filter on raw-data availability
        #[arg(long)]
        available: Option<bool>,

        #[arg(long)]
        flag: Option<String>,

        #[arg(long)]
        label: Option<String>,

        #[arg(short, long, default_value_t = parley_core::metadata::DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },

    /// Load one full exchange from its log file
    Get {
        id: String,

        /// Project id (defaults to the current project)
        #[arg(long)]
        project_id: Option<String>,
    },

    /// Free-text search over prompts and responses
    Search {
        text: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Mark rows whose log files are gone as unavailable
    Validate {
        /// Project id (defaults to the current project)
        #[arg(long)]
        project_id: Option<String>,
    },

    /// Re-scan the logs into the index
    Rebuild {
        /// Delete the index first so every row is rebuilt from the logs
        #[arg(long)]
        fresh: bool,
    },

    /// Move log files that sit in the wrong area
    Heal,

    /// Show index statistics
    Stats,

    /// List registered projects
    Projects,

    /// Read or write a config entry
    Config { key: String, value: Option<String> },

    /// Save one JSON exchange read from stdin
    Save {
        /// Skip response parsing and derived metadata
        #[arg(long)]
        no_enrich: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::from_env()?;
    if let Some(home) = cli.home {
        config.home = home;
    }
    if let Some(project) = cli.project {
        config.project_path = project;
    }
    config.validate()?;

    if let Commands::Rebuild { fresh: true } = cli.command {
        remove_index(&config)?;
    }

    let stdin = match cli.command {
        Commands::Save { .. } => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading exchange from stdin")?;
            Some(buf)
        }
        _ => None,
    };

    tracing::debug!(home = %config.home.display(), "parley starting");
    let engine = Arc::new(StorageEngine::from_config(&config));
    let command = cli.command;
    let home = config.home.clone();

    // Engine calls block on file and SQLite I/O.
    let output = tokio::task::spawn_blocking(move || {
        let report = engine
            .initialize(&home)
            .with_context(|| format!("initializing store at {}", home.display()))?;
        run(&engine, command, report, stdin)
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run(
    engine: &StorageEngine,
    command: Commands,
    report: parley_store::InitReport,
    stdin: Option<String>,
) -> Result<Value> {
    let current = engine.project().id.clone();

    let output = match command {
        Commands::Init => json!({
            "root": engine.root()?,
            "project": engine.project(),
            "report": report,
        }),
        Commands::Query {
            project_id,
            all_projects,
            purpose,
            provider,
            model,
            after,
            before,
            available,
            flag,
            label,
            limit,
        } => {
            let filter = MetadataFilter {
                project_id: if all_projects {
                    None
                } else {
                    Some(project_id.unwrap_or(current))
                },
                purpose: purpose.as_deref().map(Purpose::from),
                provider_id: provider,
                model_id: model,
                after,
                before,
                raw_data_available: available,
                has_flag: flag,
                has_label: label,
                limit,
            };
            serde_json::to_value(engine.query_metadata(&filter)?)?
        }
        Commands::Get { id, project_id } => {
            let project_id = project_id.unwrap_or(current);
            match engine.get(&id, &project_id)? {
                Some(exchange) => serde_json::to_value(exchange)?,
                None => anyhow::bail!("exchange {id} not found in project {project_id}"),
            }
        }
        Commands::Search { text, limit } => serde_json::to_value(engine.search_by_text(&text, limit)?)?,
        Commands::Validate { project_id } => {
            let project_id = project_id.unwrap_or(current);
            json!({
                "projectId": project_id,
                "markedUnavailable": engine.validate_availability(&project_id)?,
            })
        }
        Commands::Rebuild { fresh: true } => serde_json::to_value(report.rebuild)?,
        Commands::Rebuild { fresh: false } => serde_json::to_value(engine.rebuild_index()?)?,
        Commands::Heal => serde_json::to_value(engine.heal()?)?,
        Commands::Stats => serde_json::to_value(engine.stats()?)?,
        Commands::Projects => serde_json::to_value(engine.list_projects()?)?,
        Commands::Config { key, value } => {
            if let Some(value) = value
                && !engine.set_config(&key, &value)?
            {
                anyhow::bail!("could not store config {key}");
            }
            json!({ "key": key, "value": engine.get_config(&key)? })
        }
        Commands::Save { no_enrich } => {
            let body = stdin.unwrap_or_default();
            let exchange = parse_exchange(&body)?;
            let project = engine.project().clone();
            let saved = if no_enrich {
                engine.save(&exchange, &project)?
            } else {
                engine.ingest(&exchange, &project)?
            };
            match saved {
                Some(id) => json!({ "id": id, "projectId": project.id }),
                None => anyhow::bail!("exchange {} was not saved", exchange.id),
            }
        }
    };

    Ok(output)
}

/// Decode an exchange leniently, assigning an id when the input has none.
fn parse_exchange(body: &str) -> Result<parley_core::Exchange> {
    let mut value: Value = serde_json::from_str(body).context("stdin is not a JSON object")?;
    let object = value
        .as_object_mut()
        .context("stdin is not a JSON object")?;
    if !object.get("id").is_some_and(|id| id.as_str().is_some_and(|s| !s.is_empty())) {
        object.insert("id".to_string(), Value::String(ulid::Ulid::new().to_string()));
    }
    let record = LogRecord::parse(&value.to_string())?;
    Ok(record.into_exchange(Utc::now()))
}

fn remove_index(config: &StoreConfig) -> Result<()> {
    let index = config.index_path();
    for suffix in ["", "-wal", "-shm"] {
        let mut path = index.clone().into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            tracing::info!(file = %path.display(), "removed index file");
        }
    }
    Ok(())
}
