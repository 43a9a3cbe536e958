use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use fleetledger_sync::{
    migrate_schema, open_store, report_runs_markdown, LedgerConfig, LedgerPipeline, MigrationMode,
    RunOptions, RunSummary,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fleetledger")]
#[command(about = "Fleet Ledger reconciliation and ledger-generation jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create missing daily charges for active drivers.
    Charges {
        #[command(flatten)]
        run: RunArgs,
        /// Last billing day (YYYY-MM-DD); defaults to today in the billing timezone.
        #[arg(long)]
        through: Option<NaiveDate>,
    },
    /// Unify legacy fields and reconcile commissions in one pass.
    Migrate(RunArgs),
    UnifyFields(RunArgs),
    ReconcileCommissions(RunArgs),
    /// Assign the next folio through the transactional counter.
    NextFolio {
        /// Creation instant (RFC 3339); defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Summarize the newest runs under the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Apply the PostgreSQL documents schema.
    MigrateSchema,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Compute and report without committing writes.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing() {
    let json = std::env::var("LEDGER_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("FLEETLEDGER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} dry_run={} created={} updated={} skipped={} failed={} ambiguous={} unmatched={} reports={}",
        summary.job,
        summary.run_id,
        summary.dry_run,
        summary.created,
        summary.updated,
        summary.skipped_total(),
        summary.failed,
        summary.ambiguous.len(),
        summary.unmatched.len(),
        summary.reports_dir.as_deref().unwrap_or("-"),
    );
}

async fn pipeline(config: LedgerConfig) -> Result<LedgerPipeline> {
    let store = open_store(&config).await.context("opening document store")?;
    Ok(LedgerPipeline::new(config, store))
}

async fn migration(config: LedgerConfig, mode: MigrationMode, run: RunArgs) -> Result<()> {
    let options = RunOptions {
        dry_run: run.dry_run,
        through: None,
    };
    let summary = pipeline(config).await?.run_migration(mode, options).await?;
    print_summary(&summary);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = LedgerConfig::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Charges { run, through } => {
            let options = RunOptions {
                dry_run: run.dry_run,
                through,
            };
            let summary = pipeline(config).await?.run_charges(options).await?;
            print_summary(&summary);
        }
        Commands::Migrate(run) => migration(config, MigrationMode::Full, run).await?,
        Commands::UnifyFields(run) => migration(config, MigrationMode::UnifyFields, run).await?,
        Commands::ReconcileCommissions(run) => {
            migration(config, MigrationMode::ReconcileCommissions, run).await?
        }
        Commands::NextFolio { at } => {
            let folio = pipeline(config)
                .await?
                .next_folio(at.unwrap_or_else(Utc::now))
                .await?;
            println!("{} (scope={} sequence={})", folio.folio, folio.scope, folio.sequence);
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, &config.reports_dir)?);
        }
        Commands::MigrateSchema => {
            migrate_schema(&config).await?;
            println!("schema migrated");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set LEDGER_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
