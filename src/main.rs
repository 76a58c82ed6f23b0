//! Deposit relayer
//!
//! Watches the source-chain deposit contract and fills every confirmed deposit
//! exactly once on the destination chain.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use deposit_relayer::api::{self, AppState};
use deposit_relayer::chain::ChainProvider;
use deposit_relayer::config::Settings;
use deposit_relayer::coordination::RelayCoordinator;
use deposit_relayer::metrics::{self, MetricsServer};
use deposit_relayer::shutdown::Shutdown;
use deposit_relayer::state;
use deposit_relayer::tx::{WalletSigner, DEFAULT_KEY_ENV};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    init_logging(settings.relayer.log_json);

    info!(
        "Starting deposit relayer v{} (instance {})",
        env!("CARGO_PKG_VERSION"),
        settings.relayer.instance_id
    );
    info!(
        "Relaying deposits from {} ({}) to {} ({})",
        settings.source.name,
        settings.source.chain_id,
        settings.destination.name,
        settings.destination.chain_id
    );

    // Initialize the state store (runs migrations for Postgres)
    let store = state::connect(&settings.database).await?;
    info!("State store ready");

    let source = Arc::new(ChainProvider::new(settings.source.clone())?);
    let destination = Arc::new(ChainProvider::new(settings.destination.clone())?);

    let key_env = settings
        .wallet
        .private_key_env
        .as_deref()
        .unwrap_or(DEFAULT_KEY_ENV);
    let signer = WalletSigner::from_env(key_env, settings.destination.chain_id)?;

    let shutdown = Shutdown::new();
    let coordinator = RelayCoordinator::from_settings(
        &settings,
        source.clone(),
        destination.clone(),
        Box::new(signer),
        store.clone(),
        shutdown.clone(),
    )?;
    info!(
        "Relay coordinator initialized for account {:?}",
        coordinator.submitter().account()
    );

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            store: store.clone(),
            ledger: coordinator.ledger(),
            status: coordinator.status(),
            source: source.clone(),
            destination: destination.clone(),
            started: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let shutdown = shutdown.clone();
        let chains = [
            (settings.source.chain_id, source.clone()),
            (settings.destination.chain_id, destination.clone()),
        ];
        let interval = Duration::from_secs(settings.relayer.health_check_interval_secs);
        async move {
            while shutdown.sleep(interval).await {
                let mut healthy = true;

                for (chain_id, provider) in &chains {
                    let ok = provider.health_check().await;
                    metrics::record_chain_health(*chain_id, ok);
                    if !ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    // Translate OS signals into a graceful shutdown
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining in-flight fills...");
            shutdown.trigger();
        }
    });

    info!("Deposit relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    let result = coordinator.run().await;

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    result?;
    info!("Deposit relayer stopped");
    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,deposit_relayer=debug,sqlx=warn,hyper=warn,tower_http=info")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
