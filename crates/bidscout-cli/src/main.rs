use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bidscout_adapters::{cancel_pair, CancelHandle};
use bidscout_core::CollectionResult;
use bidscout_sync::{
    build_scheduler, open_store, DateRange, Orchestrator, PgNoticeStore, RunOptions, SyncConfig,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bidscout")]
#[command(about = "Bid notice scraping and classification")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every active organization.
    Sync(SyncArgs),
    /// Scrape a single organization.
    Scrape {
        org_name: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        debug: bool,
    },
    /// Scrape the detail page of a stored notice.
    Detail {
        notice_id: i64,
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    /// Run syncs on the `SYNC_CRON` schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    debug: bool,
    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
}

impl SyncArgs {
    fn options(&self) -> Result<RunOptions> {
        let date_range = match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => bail!("--from {from} is after --to {to}"),
            (Some(from), Some(to)) => Some(DateRange { from, to }),
            _ => None,
        };
        Ok(RunOptions {
            limit: self.limit,
            dry_run: self.dry_run,
            debug: self.debug,
            date_range,
        })
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight pages");
            handle.cancel();
        }
    });
}

fn print_result(result: &CollectionResult) {
    println!(
        "{}: status={:?} seen={} collected={} dropped={} new={} inserted={} archived={} errors={}",
        result.scope,
        result.status,
        result.total_seen,
        result.collected,
        result.dropped,
        result.new,
        result.inserted,
        result.archived,
        result.error_count
    );
    for err in &result.errors {
        eprintln!("  {err}");
    }
}

async fn orchestrator(config: SyncConfig) -> Result<Orchestrator> {
    let store = open_store(&config).await?;
    let (handle, signal) = cancel_pair();
    cancel_on_ctrl_c(handle);
    Ok(Orchestrator::with_fetch_layer(config, store)?.with_cancel(signal))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let options = args.options()?;
            let report = orchestrator(config).await?.run_batch(&options).await;
            for result in &report.organizations {
                print_result(result);
            }
            println!("sync complete: run_id={}", report.run_id);
            print_result(&report.total);
        }
        Commands::Scrape {
            org_name,
            dry_run,
            debug,
        } => {
            let options = RunOptions {
                dry_run,
                debug,
                ..Default::default()
            };
            let result = orchestrator(config).await?.run_single(&org_name, &options).await;
            print_result(&result);
        }
        Commands::Detail { notice_id, dry_run } => {
            let options = RunOptions {
                dry_run,
                ..Default::default()
            };
            let scrape = orchestrator(config)
                .await?
                .fetch_notice_detail(notice_id, &options)
                .await
                .with_context(|| format!("scraping detail of notice {notice_id}"))?;
            println!("{}", serde_json::to_string_pretty(&scrape)?);
        }
        Commands::Migrate => {
            let store = PgNoticeStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set BIDSCOUT_SCHEDULER_ENABLED=1");
            }
            let cron = config.sync_cron.clone();
            let orchestrator = Arc::new(orchestrator(config).await?);
            let mut sched = build_scheduler(orchestrator, &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
