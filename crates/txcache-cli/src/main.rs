use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use txcache_core::{DateRange, TransactionSource};
use txcache_sync::{FetchRequest, PgStore, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "txcache-cli")]
#[command(about = "Transaction cache command-line interface")]
struct Cli {
    /// Debug-level logs unless RUST_LOG is set.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve {
        /// Keep the cache in process memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Fetch one range through the cache and print the result.
    Fetch {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value = "zoho")]
        source: TransactionSource,
        /// Skip the cache check.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        memory: bool,
    },
    /// List cache segments.
    Segments {
        #[arg(long)]
        source: Option<TransactionSource>,
    },
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = if json {
        fmt().json().with_env_filter(env_filter).with_target(true).try_init()
    } else {
        fmt().compact().with_env_filter(env_filter).with_target(true).try_init()
    };
    result.map_err(|err| anyhow!("initializing tracing: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json)?;

    match cli.command.unwrap_or(Commands::Serve { memory: false }) {
        Commands::Serve { memory } => {
            txcache_web::serve_from_env(memory).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Fetch {
            start,
            end,
            source,
            force,
            memory,
        } => {
            let range = DateRange::new(start, end)?;
            let service = txcache_sync::build_service_from_env(memory).await?;
            let outcome = service
                .fetch_transactions(FetchRequest {
                    source,
                    range,
                    force_refresh: force,
                })
                .await?;
            println!(
                "fetch complete: source={} range={} cached={} partial={} transactions={} skipped={}",
                outcome.source,
                range,
                outcome.cached,
                outcome.partial,
                outcome.transactions.len(),
                outcome.skipped.total()
            );
            if let Some(report) = &outcome.store_report {
                println!(
                    "stored: batches_ok={} batches_failed={} submitted={} stored={} segment={}",
                    report.batches_ok,
                    report.batches_failed,
                    report.submitted,
                    report.stored,
                    report.segment_status.as_str()
                );
            }
            if let Some(sha256) = &outcome.raw_sha256 {
                println!("upstream body sha256={sha256}");
            }
            if let Some(err) = &outcome.error {
                eprintln!("upstream body could not be decoded: {err}");
            }
            println!("{}", serde_json::to_string_pretty(&outcome.transactions)?);
        }
        Commands::Segments { source } => {
            let config = SyncConfig::from_env();
            let store = txcache_sync::connect_store(&config, false).await?;
            for segment in store.list_segments(source).await? {
                println!(
                    "{} {}..={} status={} transactions={} refreshed={}",
                    segment.source,
                    segment.start_date,
                    segment.end_date,
                    segment.status.as_str(),
                    segment.transaction_count,
                    segment.last_refreshed_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
