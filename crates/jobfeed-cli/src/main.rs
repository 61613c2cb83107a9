use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobfeed_engine::{
    register_default_handlers, register_default_tasks, AuditSink, EngineConfig, ExtractionManager,
    JsonlAuditSink, Scheduler, TaskQueue,
};
use jobfeed_extractors::{build_extractors, builtin_profiles, load_source_registry, merge_profiles};
use jobfeed_storage::{
    Browser, HttpBrowser, ListingRepository, MemoryListingRepository, PgListingRepository,
};
use jobfeed_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "JobFeed listing ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run extraction once: every source, or one with --source.
    Extract {
        #[arg(long)]
        source: Option<String>,
        /// Run sources in parallel chunks of this size instead of
        /// sequentially.
        #[arg(long)]
        concurrent: Option<usize>,
    },
    /// Run the scheduler, queue runner and HTTP API until interrupted.
    Serve,
    /// List registered sources.
    Sources,
}

struct Services {
    manager: Arc<ExtractionManager>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<Scheduler>,
    repository: Arc<dyn ListingRepository>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let services = build_services(&config).await?;

    match cli.command.unwrap_or(Commands::Extract {
        source: None,
        concurrent: None,
    }) {
        Commands::Extract { source, concurrent } => {
            let outcomes = match (source, concurrent) {
                (Some(source), _) => vec![services.manager.run(&source).await],
                (None, Some(max_concurrent)) => {
                    let names = services.manager.available_sources();
                    services.manager.run_concurrent(&names, max_concurrent).await
                }
                (None, None) => services.manager.run_all().await,
            };
            for outcome in &outcomes {
                println!(
                    "{}: success={} scraped={} new={} updated={} errors={}",
                    outcome.source,
                    outcome.success,
                    outcome.scraped,
                    outcome.new,
                    outcome.updated,
                    outcome.errors.len()
                );
            }
        }
        Commands::Sources => {
            for source in services.manager.available_sources() {
                println!("{source}");
            }
        }
        Commands::Serve => serve(&config, services).await?,
    }

    Ok(())
}

async fn build_services(config: &EngineConfig) -> Result<Services> {
    let repository: Arc<dyn ListingRepository> = match &config.database_url {
        Some(url) => {
            let repository = PgListingRepository::connect(url).await?;
            repository.migrate().await?;
            info!("using postgres listing store");
            Arc::new(repository)
        }
        None => {
            warn!("DATABASE_URL not set, listings are stored in memory only");
            Arc::new(MemoryListingRepository::new())
        }
    };

    let browser: Arc<dyn Browser> = Arc::new(HttpBrowser::new(config.browser_config()));
    let profiles = match &config.sources_file {
        Some(path) => merge_profiles(builtin_profiles(), load_source_registry(path)?),
        None => builtin_profiles(),
    };
    let extractors = build_extractors(&profiles, browser, repository.clone());
    let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(config.audit_log.clone()));
    let manager = Arc::new(ExtractionManager::new(extractors, audit, config.manager_config()));

    let queue = Arc::new(TaskQueue::new(config.queue_config()));
    register_default_handlers(&queue, manager.clone(), repository.clone(), config.stale_days).await;

    let scheduler = Arc::new(Scheduler::new());
    register_default_tasks(&scheduler, queue.clone(), config).await;

    Ok(Services {
        manager,
        queue,
        scheduler,
        repository,
    })
}

async fn serve(config: &EngineConfig, services: Services) -> Result<()> {
    let shutdown = CancellationToken::new();

    let queue = services.queue.clone();
    let queue_shutdown = shutdown.clone();
    let runner = tokio::spawn(async move { queue.run(queue_shutdown).await });

    // Queue lifecycle events go to the log from a dedicated task so
    // observers never sit in the queue's processing path.
    let mut events = services.queue.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(?event, "queue event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "queue event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    services.scheduler.start().await?;

    let state = AppState {
        manager: services.manager.clone(),
        queue: services.queue.clone(),
        scheduler: services.scheduler.clone(),
        repository: services.repository.clone(),
    };
    let web = tokio::spawn(jobfeed_web::serve(state, config.web_port));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    services.scheduler.stop().await?;
    let _ = runner.await;
    web.abort();
    Ok(())
}
