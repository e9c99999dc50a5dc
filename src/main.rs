// ABOUTME: CLI entry point for citizen-sync
// ABOUTME: Parses commands and routes to appropriate handlers

use anyhow::Context;
use citizen_sync::commands;
use citizen_sync::config::SyncConfig;
use citizen_sync::orchestrator::SyncRequest;
use citizen_sync::regenerate::TriggerSource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "citizen-sync")]
#[command(about = "Sync citizen and service records from the remote data API into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML configuration file (defaults to ~/.citizen-sync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Target PostgreSQL URL (falls back to DATABASE_URL env)
    #[arg(long = "database-url", env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sync cursor of every table and the live scheduler state
    Status,
    /// Sync a single table
    Sync {
        /// Local, remote or ml_ name of the table
        table: String,
        /// Window start (YYYY-MM-DD); defaults to where the last sync ended
        #[arg(long)]
        start_date: Option<String>,
        /// Window end (YYYY-MM-DD); defaults to today
        #[arg(long)]
        end_date: Option<String>,
        /// Ignore the cursor and start from the epoch
        #[arg(long, default_value_t = false)]
        force_full: bool,
    },
    /// Sync every table in dependency order
    SyncAll {
        /// Rebuild derived tables right after a run with at least one success
        #[arg(long, default_value_t = false)]
        regenerate: bool,
    },
    /// Rebuild derived tables
    Regenerate {
        /// Tables to rebuild (comma-separated); all when omitted
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Recorded in the regeneration log (scheduler, manual, admin)
        #[arg(long = "triggered-by", default_value = "manual")]
        triggered_by: String,
    },
    /// Log in to the remote API and show the issued token's expiry
    TestAuth,
    /// Call one table's endpoint and describe the response without writing anything
    TestFetch {
        table: String,
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Ask the running scheduler to start a full sync now
    Trigger,
    /// Run the weekly scheduler in the foreground if this process wins the election
    Serve {
        /// Start a full sync immediately after election
        #[arg(long, default_value_t = false)]
        run_now: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    citizen_sync::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let mut config = SyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }

    match cli.command {
        Commands::Status => commands::status(&config).await,
        Commands::Sync {
            table,
            start_date,
            end_date,
            force_full,
        } => {
            let request = SyncRequest {
                table,
                start_date,
                end_date,
                force_full,
            };
            commands::sync(&config, request).await
        }
        Commands::SyncAll { regenerate } => commands::sync_all(&config, regenerate).await,
        Commands::Regenerate {
            tables,
            triggered_by,
        } => {
            let trigger: TriggerSource = triggered_by
                .parse()
                .context("Invalid --triggered-by value")?;
            commands::regenerate(&config, &tables, trigger).await
        }
        Commands::TestAuth => commands::test_auth(&config).await,
        Commands::TestFetch {
            table,
            start_date,
            end_date,
            page_size,
        } => {
            commands::test_fetch(
                &config,
                commands::probe::FetchProbeOptions {
                    table,
                    start_date,
                    end_date,
                    page_size,
                },
            )
            .await
        }
        Commands::Trigger => commands::trigger_sync(&config).await,
        Commands::Serve { run_now } => commands::serve(&config, run_now).await,
    }
}
