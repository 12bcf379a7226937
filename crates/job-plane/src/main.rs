//! Job-plane service binary.
//!
//! Wires the store, the NATS consumer loop, and the lock-recovery sweeper
//! together and runs until Ctrl+C/SIGTERM.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use job_plane::{
    clients::{FlyteClient, HttpCreditsClient},
    config::{AppConfig, DatabaseConfig},
    db::create_pool,
    events::ProgressHandler,
    nats::{NatsPublisher, NatsSubscriber},
    services::{CostService, LifecycleService, Sweeper, YamlTemplateRegistry},
    store::PgJobStore,
};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,job_plane=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting job plane");

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        nats_url = %app_config.nats_url,
        engine_url = %app_config.engine_url,
        sweep_interval = app_config.sweep_interval,
        debug = app_config.debug,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    let store = PgJobStore::new(db_pool);
    store.ensure_schema().await?;

    let nats_client = job_plane::nats::connect(&app_config.nats_url).await?;
    let publisher = NatsPublisher::new(nats_client.clone()).await?;
    let subscriber = NatsSubscriber::new(nats_client).await?;

    let templates = YamlTemplateRegistry::from_file(&app_config.templates_path)?;
    let engine = FlyteClient::new(&app_config.engine_url);
    let credits = HttpCreditsClient::new(&app_config.credits_url);

    let lifecycle = LifecycleService::new(store.clone(), publisher.clone());
    let cost = CostService::new(
        store,
        publisher.clone(),
        credits,
        &app_config.service_name,
    );
    let handler = ProgressHandler::new(lifecycle.clone(), cost, engine, templates);

    let sweeper = Sweeper::new(lifecycle, &app_config);
    let sweeper_task = tokio::spawn(sweeper.run());

    let consumer_task = tokio::spawn(async move {
        if let Err(e) = subscriber.run(&handler).await {
            tracing::error!(error = %e, "Consumer loop failed");
        }
    });

    shutdown_signal().await;

    sweeper_task.abort();
    consumer_task.abort();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
