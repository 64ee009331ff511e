use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use opstat_storage::{parse_trigger, ObjectRef};
use opstat_sync::{MemoryWarehouse, PgWarehouse, Pipeline, PipelineConfig, ReconcilePolicy, Warehouse};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opstat-cli")]
#[command(about = "Open platform connection status pipeline")]
struct Cli {
    /// Use an in-memory warehouse instead of connecting to DATABASE_URL.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flatten a raw CDC batch into partitioned parquet.
    CleanCdc {
        #[arg(long)]
        event: PathBuf,
    },
    /// Clean a table export announced by its manifest summary.
    CleanExport {
        #[arg(long)]
        event: PathBuf,
    },
    /// Append facts for a cleaned CDC file.
    LoadStreaming {
        #[arg(long)]
        event: PathBuf,
    },
    /// Reconcile a cleaned table export against the fact table.
    LoadSnapshot {
        #[arg(long)]
        export_id: String,
        #[arg(long)]
        table: String,
        #[arg(long, value_enum, default_value_t = PolicyArg::Delta)]
        policy: PolicyArg,
    },
    /// Write CRM company updates for a cleaned CDC file.
    ExportCrm {
        #[arg(long)]
        event: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Delta,
    Snapshot,
}

impl From<PolicyArg> for ReconcilePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Delta => ReconcilePolicy::Delta,
            PolicyArg::Snapshot => ReconcilePolicy::Snapshot,
        }
    }
}

fn read_trigger(path: &Path) -> Result<ObjectRef> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parse_trigger(&value)?)
}

async fn warehouse(config: &PipelineConfig, dry_run: bool) -> Result<Arc<dyn Warehouse>> {
    if dry_run {
        return Ok(Arc::new(MemoryWarehouse::new()));
    }
    let warehouse = PgWarehouse::connect(&config.database_url, config.max_connections, config.layout()?)
        .await
        .context("connecting to warehouse")?;
    Ok(Arc::new(warehouse))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::CleanCdc { event } => {
            let trigger = read_trigger(&event)?;
            let pipeline = Pipeline::new(config, Arc::new(MemoryWarehouse::new()));
            let summary = pipeline.clean_cdc(&trigger).await?;
            println!(
                "clean-cdc complete: run_id={} rows={} files={}",
                summary.run_id,
                summary.rows,
                summary.written.len()
            );
        }
        Commands::CleanExport { event } => {
            let trigger = read_trigger(&event)?;
            let pipeline = Pipeline::new(config, Arc::new(MemoryWarehouse::new()));
            let summary = pipeline.clean_export(&trigger).await?;
            println!(
                "clean-export complete: run_id={} export_id={} table={} items={}",
                summary.run_id, summary.export_id, summary.table, summary.items
            );
        }
        Commands::LoadStreaming { event } => {
            let trigger = read_trigger(&event)?;
            let warehouse = warehouse(&config, cli.dry_run).await?;
            let summary = Pipeline::new(config, warehouse).load_streaming(&trigger).await?;
            println!(
                "load-streaming complete: run_id={} facts={} new_companies={} skipped={}",
                summary.run_id,
                summary.facts_appended,
                summary.new_companies,
                summary.skipped_events.len()
            );
        }
        Commands::LoadSnapshot {
            export_id,
            table,
            policy,
        } => {
            let warehouse = warehouse(&config, cli.dry_run).await?;
            let summary = Pipeline::new(config, warehouse)
                .load_snapshot(&export_id, &table, policy.into())
                .await?;
            println!(
                "load-snapshot complete: run_id={} connected={} disconnected={} facts={}",
                summary.run_id, summary.connected, summary.disconnected, summary.facts_appended
            );
        }
        Commands::ExportCrm { event } => {
            let trigger = read_trigger(&event)?;
            let warehouse = warehouse(&config, cli.dry_run).await?;
            let summary = Pipeline::new(config, warehouse).export_crm_updates(&trigger).await?;
            println!(
                "export-crm complete: run_id={} updates={} batches={} destination={}",
                summary.run_id,
                summary.updates,
                summary.batches,
                summary
                    .destination
                    .map(|object| object.uri())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    Ok(())
}
