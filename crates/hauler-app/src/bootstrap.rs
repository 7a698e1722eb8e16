//! Application bootstrap wiring.
//!
//! All services are constructed here and passed into the worker loops
//! explicitly; nothing is a module-level singleton. The HTTP surface
//! mounts on top of the [`TaskService`] handle this module builds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hauler_config::Settings;
use hauler_data::TaskStore;
use hauler_engine::{
    AdmissionController, CancelRegistry, Dispatcher, ProgressMonitor, Resolver, StatvfsProbe,
    TaskService,
};
use hauler_events::EventBus;
use hauler_fetch::{HttpFetcher, HttpFetcherConfig};
use hauler_provider::{DebridClient, DebridConfig};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often the janitor sweeps stale partial downloads.
const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything the boot sequence wires together.
pub(crate) struct AppHandles {
    pub(crate) service: TaskService,
    pub(crate) settings: Arc<Settings>,
    workers: Vec<JoinHandle<()>>,
}

/// Construct every service from the environment.
pub(crate) async fn build() -> Result<AppHandles> {
    let config_path = std::env::var_os("HAULER_CONFIG").map(PathBuf::from);
    let settings = Arc::new(
        Settings::load(config_path.as_deref()).context("failed to load configuration")?,
    );
    std::fs::create_dir_all(&settings.storage.root).with_context(|| {
        format!(
            "failed to create storage root {}",
            settings.storage.root.display()
        )
    })?;

    let events = EventBus::new();
    let store = TaskStore::connect(&settings.storage.database_path(), events.clone())
        .await
        .context("failed to open task store")?;

    if settings.provider.api_key.is_empty() {
        warn!("provider api key is not configured; provider operations will fail");
    }
    let provider = Arc::new(
        DebridClient::new(DebridConfig {
            base_url: settings.provider.base_url.clone(),
            api_key: settings.provider.api_key.clone(),
            agent: settings.provider.agent.clone(),
            rate_per_sec: settings.provider.rate_per_sec,
            rate_burst: settings.provider.rate_burst,
            unlock_concurrency: settings.concurrency.unlock_concurrency,
            connect_timeout: settings.provider.connect_timeout(),
            read_timeout: settings.provider.read_timeout(),
        })
        .context("failed to build provider client")?,
    );
    let executor = Arc::new(
        HttpFetcher::new(HttpFetcherConfig {
            segment_min_bytes: settings.fetch.segment_min_bytes,
            retries: settings.fetch.dl_retries,
            retry_backoff: Duration::from_secs(1),
            min_free_bytes: settings.storage.min_free_bytes,
            connect_timeout: settings.provider.connect_timeout(),
            read_timeout: settings.provider.read_timeout(),
        })
        .context("failed to build download executor")?,
    );

    let cancels = CancelRegistry::new();
    let admission = AdmissionController::new(
        Arc::new(StatvfsProbe),
        settings.storage.root.clone(),
        settings.storage.floor_bytes(),
    );

    let resolver = Arc::new(Resolver::new(
        store.clone(),
        provider.clone(),
        cancels.clone(),
        settings.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        provider,
        executor,
        admission,
        cancels.clone(),
        settings.clone(),
    ));
    let monitor = Arc::new(ProgressMonitor::new(store.clone(), settings.clone()));

    let workers = vec![
        resolver.spawn(),
        dispatcher.spawn(),
        monitor.spawn(),
        spawn_janitor(settings.clone()),
    ];
    let service = TaskService::new(store, cancels, settings.clone());

    Ok(AppHandles {
        service,
        settings,
        workers,
    })
}

/// Boot the application and block until shutdown.
pub(crate) async fn run_app() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let handles = build().await?;
    info!(
        root = %handles.settings.storage.root.display(),
        "hauler orchestrator started"
    );

    // the store is the single source of truth: report what survives a
    // restart so operators can see resumption at a glance
    let (_, total) = handles
        .service
        .list(None, 1, 0)
        .await
        .map_err(|err| anyhow::anyhow!(err))?;
    info!(tasks = total, "task store loaded");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; stopping workers");
    for worker in &handles.workers {
        worker.abort();
    }
    Ok(())
}

fn spawn_janitor(settings: Arc<Settings>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_age = Duration::from_secs(settings.retention.partial_max_age_hours * 3600);
        loop {
            tokio::time::sleep(JANITOR_INTERVAL).await;
            match hauler_fsops::purge_stale_partials(&settings.storage.root, max_age) {
                Ok(0) => {}
                Ok(removed) => info!(removed, "janitor removed stale partial downloads"),
                Err(err) => warn!(error = %err, "janitor sweep failed"),
            }
        }
    })
}
