//! Orchestrator host binary.
//!
//! Deployments use this as the reference wiring: register workflows in
//! [`build_registry`], list their manifests and groups in [`seed_list`],
//! and run. Everything else — schedule evaluation, dispatch, retries,
//! dead-lettering, recovery — comes from the library.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::config::Config;
use conductor_core::dispatcher::{DispatcherConfig, GroupSlots, JobDispatcher};
use conductor_core::kernel::{Clock, SystemClock};
use conductor_core::manager::{CleanupSweeper, ManagerConfig, ManifestManager};
use conductor_core::seeding::{self, ManifestSeed};
use conductor_core::service::ServiceHost;
use conductor_core::store::{ManifestGroup, PostgresStore, SharedStore};
use conductor_core::taskserver::{completion_channel, TokioTaskServer};
use junction::{RegistryBus, WorkflowRegistry};

/// Register every workflow this deployment ships.
fn build_registry() -> Result<WorkflowRegistry> {
    let registry = WorkflowRegistry::new();
    // registry.register(billing::InvoiceSweep::default())?;
    Ok(registry)
}

/// Groups and manifests this deployment seeds at startup.
fn seed_list() -> (Vec<ManifestGroup>, Vec<ManifestSeed>) {
    (Vec::new(), Vec::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    let postgres = PostgresStore::new(pool);
    postgres.migrate().await.context("running migrations")?;
    let store: SharedStore = Arc::new(postgres);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = Arc::new(build_registry()?);
    if registry.registered_names().is_empty() {
        warn!("no workflows registered; the dispatcher will dead-letter anything it claims");
    }

    // Seeding validates the dependency DAG; a cycle refuses startup.
    let (groups, manifests) = seed_list();
    let report = seeding::seed(&store, &registry, groups, manifests)
        .await
        .context("seeding manifests")?;
    info!(
        manifests = report.manifests,
        groups = report.groups,
        "seeded and validated"
    );

    let bus = Arc::new(RegistryBus::new(registry.clone()));
    let (completions_tx, completions_rx) = completion_channel();
    let task_server = Arc::new(TokioTaskServer::new(
        Arc::clone(&store),
        bus,
        Arc::clone(&clock),
        completions_tx,
    ));

    let cleanup = config.metadata_cleanup.clone().map(|cleanup_config| {
        CleanupSweeper::new(
            Arc::clone(&store),
            cleanup_config,
            chrono::Duration::from_std(config.dead_letter_retention_period)
                .unwrap_or_else(|_| chrono::Duration::days(30)),
            config.auto_purge_dead_letters,
        )
    });

    let mut host = ServiceHost::new();
    if config.manifest_manager_enabled {
        host = host.with_service(ManifestManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            ManagerConfig::from_config(&config),
            cleanup,
        ));
    }
    if config.job_dispatcher_enabled {
        host = host.with_service(JobDispatcher::new(
            Arc::clone(&store),
            registry,
            task_server.clone(),
            GroupSlots::new(),
            Arc::clone(&clock),
            DispatcherConfig::from_config(&config),
            completions_rx,
        ));
    }

    host.run_until_shutdown(config.drain_timeout).await?;
    task_server.drain().await;
    info!("conductor stopped");
    Ok(())
}
