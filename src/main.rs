use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use listing_scout::config::AppConfig;
use listing_scout::db::store::Store;
use listing_scout::listings::provider::HttpSnapshotProvider;
use listing_scout::matching::engine::MatchEngine;
use listing_scout::monitoring::health::{spawn_health_server, HealthState};
use listing_scout::monitoring::logger;
use listing_scout::notify::NotifyClient;
use listing_scout::scheduler::lifecycle::WatchState;
use listing_scout::scheduler::scheduler::Scheduler;
use listing_scout::sync::crm::CrmClient;
use listing_scout::sync::dispatcher::SyncDispatcher;
use listing_scout::sync::limiter::create_rate_limiter;

#[derive(Parser)]
#[command(name = "listing-scout", about = "Autonomous listing matching and CRM sync engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, secrets) = AppConfig::load_from(&cli.config)?;

    logger::init_logging(&config.monitoring)?;

    tracing::info!(
        check_interval_s = config.scheduler.check_interval_seconds,
        rate_limit_per_min = config.rate_limit.requests_per_minute,
        "Listing scout starting"
    );

    let store = Store::new(&config.database.path).await?;

    let provider = Arc::new(HttpSnapshotProvider::new(&config.snapshot)?);
    let crm = Arc::new(CrmClient::new(&config.crm, secrets.crm_api_key)?);
    let limiter = create_rate_limiter(&config.rate_limit);
    let notifier = Arc::new(NotifyClient::new(
        secrets.notify_webhook_url,
        config.notifications.enabled,
    ));

    let engine = Arc::new(MatchEngine::new(
        store.clone(),
        provider,
        config.matching.min_score_threshold,
    ));
    let dispatcher = Arc::new(SyncDispatcher::new(
        store.clone(),
        crm,
        limiter,
        config.rate_limit.clone(),
        notifier,
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        engine,
        dispatcher,
        config.scheduler.clone(),
    );

    let health_state = HealthState::new();
    let _health_handle = spawn_health_server(health_state.clone(), config.monitoring.health_port);

    let tick_interval = Duration::from_secs(config.scheduler.tick_interval_seconds);
    let mut ticks: u64 = 0;

    loop {
        if let Err(e) = scheduler.tick().await {
            tracing::error!(error = %e, "Scheduler tick failed");
        }

        ticks += 1;
        let active = store
            .count_watches_in_state(WatchState::Active)
            .await
            .unwrap_or(0);
        health_state.record_tick(ticks, active);

        tokio::time::sleep(tick_interval).await;
    }
}
