use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use engage_engine::config::EngineConfig;
use engage_engine::hub::BroadcastHub;
use engage_engine::progress::ProgressAggregator;
use engage_engine::replay;
use engage_engine::server::{self, AppState, StaticTokenVerifier, TokenVerifier};
use engage_engine::session::SessionManager;
use engage_engine::storage::{MemoryStore, PgStore, SnapshotStore};

#[derive(Parser)]
#[command(name = "engage-engine")]
#[command(about = "Real-time engagement engine for the adaptive-learning dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo learner snapshot
    Seed,
    /// Run the broadcast server
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Replay recorded classifier frames from a CSV file
    Replay {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        learner: Option<Uuid>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect_pool().await?;
            PgStore::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect_pool().await?;
            PgStore::seed(&pool).await?;
            println!("Seed snapshot inserted.");
        }
        Commands::Serve { bind, config } => {
            let config = load_config(config.as_deref())?;

            let store: Arc<dyn SnapshotStore> = match std::env::var("DATABASE_URL") {
                Ok(url) => {
                    let pool = PgPoolOptions::new()
                        .max_connections(5)
                        .connect(&url)
                        .await
                        .context("failed to connect to Postgres")?;
                    Arc::new(PgStore::new(pool))
                }
                Err(_) => {
                    warn!("DATABASE_URL not set, snapshots held in memory only");
                    Arc::new(MemoryStore::new())
                }
            };

            let verifier = build_verifier()?;
            let state = AppState {
                hub: Arc::new(BroadcastHub::new(config.hub_channel_capacity)),
                aggregator: Arc::new(ProgressAggregator::new(store)),
                sessions: Arc::new(SessionManager::new(config)),
                verifier,
            };
            server::serve(bind, state).await?;
        }
        Commands::Replay {
            csv,
            learner,
            config,
            out,
        } => {
            let config = load_config(config.as_deref())?;
            let learner_id = learner.unwrap_or_else(Uuid::new_v4);
            let result = replay::replay_csv(&csv, learner_id, &config).await?;
            let report = replay::build_report(learner_id, &result);

            match out {
                Some(path) => {
                    std::fs::write(&path, report)?;
                    println!("Report written to {}.", path.display());
                }
                None => print!("{report}"),
            }
        }
    }

    Ok(())
}

async fn connect_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(config)
}

fn build_verifier() -> anyhow::Result<Arc<dyn TokenVerifier>> {
    let mut verifier = StaticTokenVerifier::new();
    match std::env::var("ENGAGE_ADMIN_TOKEN") {
        Ok(token) => verifier = verifier.with_admin(token),
        Err(_) => warn!("ENGAGE_ADMIN_TOKEN not set, admin connections will be rejected"),
    }
    if let Ok(pairs) = std::env::var("ENGAGE_STUDENT_TOKENS") {
        verifier = verifier
            .with_student_pairs(&pairs)
            .context("invalid ENGAGE_STUDENT_TOKENS")?;
    }
    Ok(Arc::new(verifier))
}
