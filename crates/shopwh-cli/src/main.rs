use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use shopwh_core::EntityKind;
use shopwh_storage::{PgWarehouse, Warehouse};
use shopwh_sync::{pipeline_from_config, recent_runs_markdown, RunStages, RunSummary, SyncConfig};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "shopwh")]
#[command(about = "Sync commerce API orders and products into the warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Fallback log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Treat this date as today when resolving the order window.
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync, refresh aggregate views, validate and write the run report.
    Run,
    /// Sync orders and products only.
    Sync,
    /// Refresh aggregate views only.
    Refresh,
    /// Create missing tables, views and indexes.
    InitDb,
    /// Show recent run reports and warehouse counts.
    Status {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = SyncConfig::from_env();
    let today = cli.today.unwrap_or_else(|| Local::now().date_naive());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_stages(&config, RunStages::ALL, today).await?,
        Commands::Sync => run_stages(&config, RunStages::SYNC_ONLY, today).await?,
        Commands::Refresh => run_stages(&config, RunStages::REFRESH_ONLY, today).await?,
        Commands::InitDb => {
            let store = connect(&config).await?;
            store.ensure_schema().await.context("creating warehouse schema")?;
            println!("schema ready");
        }
        Commands::Status { runs } => {
            match recent_runs_markdown(runs, &config.reports_dir) {
                Ok(markdown) => println!("{markdown}"),
                Err(err) => eprintln!("no run reports: {err:#}"),
            }
            let store = connect(&config).await?;
            for (table, count) in store.table_counts().await? {
                println!("{table}: {count}");
            }
            for entity in [EntityKind::Orders, EntityKind::Products] {
                let pending = store.pending_failures(entity).await?;
                println!("{entity} pending failures: {}", pending.len());
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgWarehouse> {
    PgWarehouse::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to warehouse database")
}

async fn run_stages(config: &SyncConfig, stages: RunStages, today: NaiveDate) -> Result<()> {
    let pipeline = pipeline_from_config(config).await?;
    let summary = pipeline.run(stages, today).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} status={:?} reports={}",
        summary.run_id,
        summary.status,
        summary.reports_dir.as_deref().unwrap_or("-")
    );
    for report in summary.entity_reports() {
        println!(
            "  {}: upserted={} items={} replayed={} pages={}/{} failures={}",
            report.entity,
            report.records_upserted,
            report.items_upserted,
            report.records_replayed,
            report.pages_processed,
            report.total_pages,
            report.record_failures.len()
        );
    }
    if let Some(refresh) = &summary.refresh {
        for (view, rows) in refresh.row_counts() {
            println!("  {view}: {rows} rows");
        }
    }
}
