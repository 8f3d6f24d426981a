use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use leadsync_storage::LeadRepository;
use leadsync_sync::{report_recent_runs, SyncConfig, SyncMode, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Pulls ad lead forms and their leads into the CRM database")]
struct Cli {
    /// Restrict the command to one tenant from the registry.
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh pages and forms, then fetch leads.
    Sync,
    /// Refresh pages and lead forms only.
    SyncForms,
    /// Fetch leads for already known forms.
    FetchLeads,
    /// Show the identity behind a tenant's access token.
    CheckToken,
    /// Remove leads stored more than once.
    Dedupe {
        #[arg(long)]
        dry_run: bool,
        /// Also reset each form's lead count to the number of stored leads.
        #[arg(long)]
        recount_forms: bool,
    },
    Migrate,
    /// Summarise the most recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let tenant = cli.tenant.as_deref();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            print_run(&pipeline.run(SyncMode::Full, tenant).await?);
        }
        Commands::SyncForms => {
            let pipeline = SyncPipeline::from_config(config).await?;
            print_run(&pipeline.run(SyncMode::CatalogOnly, tenant).await?);
        }
        Commands::FetchLeads => {
            let pipeline = SyncPipeline::from_config(config).await?;
            print_run(&pipeline.run(SyncMode::LeadsOnly, tenant).await?);
        }
        Commands::CheckToken => {
            let Some(tenant) = tenant else {
                bail!("check-token needs --tenant");
            };
            let pipeline = SyncPipeline::from_config(config).await?;
            let identity = pipeline.check_token(tenant).await?;
            println!(
                "token ok: tenant={} user_id={} name={}",
                tenant,
                identity.id,
                identity.name.as_deref().unwrap_or("-")
            );
        }
        Commands::Dedupe {
            dry_run,
            recount_forms,
        } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            for summary in pipeline.remove_duplicates(tenant, dry_run, recount_forms).await? {
                println!(
                    "dedupe {}: tenant={} examined={} groups={} removed={} forms_recounted={}",
                    if summary.dry_run { "(dry run)" } else { "complete" },
                    summary.tenant_id,
                    summary.leads_examined,
                    summary.duplicate_groups,
                    summary.removed,
                    summary.forms_recounted
                );
            }
        }
        Commands::Migrate => {
            let repo = LeadRepository::connect(&config.database_url).await?;
            repo.migrate().await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(runs, &config.reports_dir)?);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled; set LEADSYNC_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_run(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} mode={} tenants={} inserted={} errors={} reports={}",
        summary.run_id,
        summary.mode.as_str(),
        summary.tenants.len(),
        summary.total_inserted(),
        summary.total_errors(),
        summary.reports_dir
    );
}
