use anyhow::{Context, Result};
use clap::Parser;
use klaxon_checker::cache::TriggerCache;
use klaxon_checker::check::TriggerChecker;
use klaxon_checker::worker::CheckScheduler;
use klaxon_filter::flusher::Flusher;
use klaxon_filter::index::{IndexHandle, IndexRefresher, PatternIndex};
use klaxon_filter::listener::LineListener;
use klaxon_filter::metrics::FilterMetrics;
use klaxon_filter::worker::ParserPool;
use klaxon_notify::events::FetchEventsWorker;
use klaxon_notify::notifications::FetchNotificationsWorker;
use klaxon_notify::plugin::SenderRegistry;
use klaxon_notify::scheduler::Scheduler;
use klaxon_notify::selfstate::SelfStateWorker;
use klaxon_server::config::Config;
use klaxon_server::supervisor::Supervisor;
use klaxon_store::memory::MemoryStore;
use klaxon_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Alerting engine for time-series metrics.
#[derive(Debug, Parser)]
#[command(name = "klaxon", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "klaxon.toml")]
    config: PathBuf,

    /// Print the complete default configuration and exit.
    #[arg(long)]
    default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.default_config {
        print!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    let config = Config::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("klaxon={}", config.log.level))),
        )
        .init();

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(listen = %config.filter.listen, "Klaxon starting");

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    tokio::time::timeout(
        Duration::from_secs(config.store.op_timeout_secs),
        store.ping(),
    )
    .await
    .context("store probe timed out")?
    .context("store probe failed")?;

    if config.graphite.enabled {
        tracing::info!(
            uri = %config.graphite.uri,
            prefix = %config.graphite.prefix,
            "Metrics reporting configured; the reporter runs externally"
        );
    }

    // Senders come up before any worker so misconfiguration fails startup.
    let mut registry = SenderRegistry::default();
    registry
        .configure(&config.notifier.sender_definitions())
        .context("sender configuration failed")?;
    tracing::info!(senders = ?registry.sender_types(), "Senders ready");
    let registry = Arc::new(registry);

    let mut supervisor = Supervisor::new();

    // Pattern index, primed before the listeners accept traffic.
    let index = Arc::new(IndexHandle::new(PatternIndex::empty()));
    let refresher = IndexRefresher::new(
        store.clone(),
        index.clone(),
        Duration::from_secs(config.filter.index_refresh_secs),
    );
    refresher.refresh().await;
    supervisor.spawn("index-refresher", refresher.run(supervisor.token()));

    // Filter pipeline: listeners -> parser pool -> flusher.
    let filter_metrics = Arc::new(FilterMetrics::new());
    let (lines_tx, lines_rx) = mpsc::channel(config.filter.line_queue_size);
    let (points_tx, points_rx) = mpsc::channel(config.filter.point_queue_size);

    let listener = LineListener::bind(&config.filter.listen, lines_tx, filter_metrics.clone())
        .await
        .context("filter bind failed")?;
    supervisor.spawn("filter-listener", listener.run(supervisor.token()));

    let parser_handles = ParserPool::new(
        index.clone(),
        filter_metrics.clone(),
        config.filter.retention_secs,
    )
    .spawn(
        config.filter.parser_workers,
        lines_rx,
        points_tx,
        supervisor.token(),
    );
    supervisor.adopt("filter-parser", parser_handles);

    let flusher = Flusher::new(
        store.clone(),
        config.filter.batch_size,
        Duration::from_secs(config.filter.flush_interval_secs),
        filter_metrics.clone(),
    );
    supervisor.spawn("filter-flusher", flusher.run(points_rx, supervisor.token()));

    // Checker: scheduler plus its worker pool, escalating repeated
    // evaluation failures to the watchdog.
    let (escalations_tx, escalations_rx) = mpsc::channel(64);
    let cache = TriggerCache::new(
        store.clone(),
        Duration::from_secs(config.checker.cache_ttl_secs),
    );
    let checker = Arc::new(TriggerChecker::new(
        store.clone(),
        cache,
        config.checker.checker_config(),
        escalations_tx,
    ));
    let scheduler = CheckScheduler::new(
        store.clone(),
        checker,
        Duration::from_secs(config.checker.poll_interval_secs),
        Duration::from_secs(config.checker.nodata_check_interval_secs),
        config.checker.worker_count,
        config.checker.queue_size,
    );
    supervisor.spawn("check-scheduler", scheduler.run(supervisor.token()));

    // Notifier pipeline.
    let events_worker = FetchEventsWorker::new(
        store.clone(),
        Scheduler::new(store.clone(), config.notifier.throttling.policy()),
    );
    supervisor.spawn("event-fetcher", events_worker.run(supervisor.token()));

    let notifications_worker = FetchNotificationsWorker::new(
        store.clone(),
        registry.clone(),
        config.notifier.notifications_config(),
    );
    supervisor.spawn(
        "notifications-fetcher",
        notifications_worker.run(supervisor.token()),
    );

    if config.notifier.self_state.enabled {
        let watchdog = SelfStateWorker::new(
            store.clone(),
            config.notifier.self_state.self_state_config(),
            escalations_rx,
        );
        supervisor.spawn("self-state", watchdog.run(supervisor.token()));
    } else {
        tracing::info!("Self-state watchdog disabled");
        drop(escalations_rx);
    }

    tracing::info!("Klaxon started");
    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down");

    supervisor.shutdown(Duration::from_secs(30)).await;
    tracing::info!("Klaxon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
