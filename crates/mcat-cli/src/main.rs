use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcat_adapters::{implemented_source_types, SourceType};
use mcat_core::MetricDescriptor;
use mcat_storage::PgCacheStore;
use mcat_sync::{CatalogSync, FieldMetricInfo, RoundSummary, RunStatus, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mcat-cli")]
#[command(about = "Metric catalog reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one source type, optionally scoped to one business.
    Reconcile {
        #[arg(long)]
        source: String,
        #[arg(long)]
        biz: Option<i64>,
    },
    /// Refresh every applicable source type for one business.
    RefreshBiz { biz: i64 },
    /// Run one refresh round at the given offset.
    Round {
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Upsert descriptors from a JSON array without deleting anything.
    Append { file: PathBuf },
    /// Sync result-table field rows from a JSON array of metric info.
    RefreshFields {
        #[arg(long)]
        table: String,
        file: PathBuf,
    },
    /// List source types and their business scope.
    Sources,
    Migrate,
    /// Run refresh rounds on the configured cron until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_round(summary: &RoundSummary, report: &Path) {
    for run in &summary.runs {
        println!(
            "{:<18} biz={:<6} status={:?} created={} updated={} deleted={} failed_tables={}",
            run.source_type.as_str(),
            run.bk_biz_id.map_or_else(|| "-".to_string(), |b| b.to_string()),
            run.status,
            run.created,
            run.updated,
            run.deleted,
            run.tables_failed.len()
        );
    }
    println!(
        "round complete: round_id={} runs={} skipped={} failed={} report={}",
        summary.round_id,
        summary.runs.len(),
        summary.count(RunStatus::Skipped),
        summary.failures().count(),
        report.display()
    );
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Round { offset: 0 }) {
        Commands::Reconcile { source, biz } => {
            let source_type = SourceType::parse(&source)
                .with_context(|| format!("unknown source type {source}"))?;
            let sync = CatalogSync::new(config).await?;
            let summary = sync.reconcile(source_type, biz).await?;
            println!(
                "reconcile complete: run_id={} status={:?} tables={} metrics={} created={} updated={} unchanged={} deleted={}",
                summary.run_id,
                summary.status,
                summary.tables_seen,
                summary.metrics_seen,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.deleted
            );
        }
        Commands::RefreshBiz { biz } => {
            let sync = CatalogSync::new(config).await?;
            let (summary, report) = sync.refresh_business(biz).await?;
            print_round(&summary, &report);
        }
        Commands::Round { offset } => {
            let sync = CatalogSync::new(config).await?;
            let (summary, report) = sync.run_round(offset).await?;
            print_round(&summary, &report);
        }
        Commands::Append { file } => {
            let descriptors: Vec<MetricDescriptor> = read_json(&file).await?;
            let sync = CatalogSync::new(config).await?;
            let summary = sync.append(descriptors).await?;
            println!(
                "append complete: created={} updated={} unchanged={} skipped={}",
                summary.created, summary.updated, summary.unchanged, summary.skipped
            );
        }
        Commands::RefreshFields { table, file } => {
            let metric_info: Vec<FieldMetricInfo> = read_json(&file).await?;
            let sync = CatalogSync::new(config).await?;
            let summary = sync.refresh_fields(&table, &metric_info).await?;
            println!(
                "fields refreshed: table={} metrics_created={} metrics_updated={} tags_created={} tags_updated={}",
                table,
                summary.metrics_created,
                summary.metrics_updated,
                summary.tags_created,
                summary.tags_updated
            );
        }
        Commands::Sources => {
            let implemented = implemented_source_types();
            for source_type in SourceType::ALL {
                println!(
                    "{:<18} scope={:?} implemented={}",
                    source_type.as_str(),
                    source_type.business_scope(),
                    implemented.contains(&source_type)
                );
            }
        }
        Commands::Migrate => {
            let store = PgCacheStore::connect(&config.database_url)
                .await
                .context("connecting to the catalog database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let sync = CatalogSync::new(config).await?;
            let mut sched = sync
                .maybe_build_scheduler()
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %sync.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
