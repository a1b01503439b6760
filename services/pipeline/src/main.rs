//! activity-worker - consumes the activity topic into daily counters
//!
//! ```text
//! activity-worker [run]                  consume until SIGINT/SIGTERM
//! activity-worker summary <user_id> [days]   print a user's summary as JSON
//! ```

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vault_activity::summary::DEFAULT_WINDOW_DAYS;
use vault_activity::ActivityBackends;
use vault_pipeline::{ensure_topology, ActivityConsumer, ActivityHandler, Supervisor, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("run") => run_worker(config).await,
        Some("summary") => run_summary(config, &args[2..]).await,
        Some(other) => {
            eprintln!("Usage: activity-worker [run | summary <user_id> [days]]");
            bail!("unknown command {:?}", other)
        }
    }
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    info!(
        service = %config.service.name,
        brokers = %config.kafka.bootstrap_servers,
        group = %config.kafka.consumer.group_id,
        workers = config.kafka.consumer.workers,
        "Starting activity worker"
    );

    init_metrics(config.service.metrics_port)?;

    let backends = ActivityBackends::connect(&config.database, &config.redis, &config.aggregation)
        .await
        .context("Failed to initialize activity backends")?;

    ensure_topology(&config.kafka)
        .await
        .context("Failed to declare activity topic")?;

    let handler = Arc::new(ActivityHandler::new(backends.aggregator.clone()));
    let shutdown = CancellationToken::new();
    let mut supervisor = Supervisor::new(shutdown.clone());

    for worker_id in 0..config.kafka.consumer.workers {
        let consumer = ActivityConsumer::new(&config.kafka, worker_id)
            .context("Failed to initialize Kafka consumer")?;
        let handler = handler.clone();
        supervisor.spawn(format!("consumer-{}", worker_id), move |token| async move {
            consumer.run(handler, token).await.map_err(anyhow::Error::from)
        });
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    info!("Activity worker started successfully");

    supervisor.wait().await?;

    info!("Activity worker stopped");
    Ok(())
}

async fn run_summary(config: WorkerConfig, args: &[String]) -> Result<()> {
    let user_id: i64 = args
        .first()
        .context("Usage: activity-worker summary <user_id> [days]")?
        .parse()
        .context("user_id must be an integer")?;
    let days: i64 = match args.get(1) {
        Some(days) => days.parse().context("days must be an integer")?,
        None => DEFAULT_WINDOW_DAYS,
    };

    let backends = ActivityBackends::connect(&config.database, &config.redis, &config.aggregation)
        .await
        .context("Failed to initialize activity backends")?;

    let summary = backends
        .reader
        .summary(user_id, days)
        .await
        .context("Failed to load activity summary")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
