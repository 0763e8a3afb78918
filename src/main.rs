//! Copygram Recommendation Engine
//!
//! Background service that keeps per-user follow and post recommendations
//! fresh.
//!
//! # Architecture
//!
//! - **Event Processor**: Consumes domain events from Kafka
//! - **Workers**: Run recomputation jobs behind the batch lock
//! - **Recommender**: Collaborative filtering over Postgres, results in Redis
//!
//! # Graceful Shutdown
//!
//! The engine handles SIGTERM and SIGINT signals, ensuring:
//! - The consumer stops taking new events
//! - In-flight jobs complete
//! - Database connections are closed cleanly

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use copygram::database::{with_retry, Database};
use copygram::error::Result;
use copygram::event_processor;
use copygram::recommendation::dedup;
use copygram::recommendation::lock::RedisBatchLock;
use copygram::recommendation::store::RedisRecommendationStore;
use copygram::recommendation::updater;
use copygram::{Config, PgBehaviorSource, Recommender};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 Copygram Recommendation Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Components:");
    info!("    • Kafka Event Processor");
    info!("    • Recommendation Workers");
    info!("═══════════════════════════════════════════════════════════════");

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("✅ Configuration loaded and validated");

    #[cfg(feature = "prometheus")]
    install_metrics_exporter()?;

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // The database may still be starting alongside us
    let db = with_retry(|| Database::new(&config.database), 5, Duration::from_secs(2)).await?;
    db.health_check().await?;
    let stats = db.stats();
    info!(
        "✅ Database connection pool established (size: {}, idle: {})",
        stats.size, stats.idle
    );

    let store = RedisRecommendationStore::connect(&config.redis.url).await?;
    store.health_check().await?;
    let lock = RedisBatchLock::connect(
        &config.redis.url,
        config.worker.lock_key.clone(),
        config.worker.lock_ttl,
    )
    .await?;
    info!("✅ Redis store and batch lock connected");

    let dedup = dedup::from_config(&config.dedup)?;
    info!("✅ Dedup oracle ready ({:?})", config.dedup.mode);

    let recommender = Recommender::new(
        Arc::new(PgBehaviorSource::new(db.pool().clone())),
        Arc::new(store),
        dedup,
        config.recommendation.clone(),
    );

    let mut handles = Vec::new();

    info!(
        "🧵 Starting {} recommendation workers...",
        config.worker.concurrency
    );
    let (queue, workers) = updater::spawn_workers(
        recommender,
        Arc::new(lock),
        config.worker.clone(),
        shutdown_tx.subscribe(),
    );
    handles.push(tokio::spawn(async move {
        match workers.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Worker pool failed: {:?}", e),
            Err(e) => error!("Worker pool panicked: {:?}", e),
        }
    }));

    if config.kafka.enabled {
        info!("🎯 Starting real-time event processor...");
        handles.push(event_processor::spawn_event_processor(
            config.kafka.clone(),
            queue.clone(),
            shutdown_tx.subscribe(),
        ));
    } else {
        warn!("⚠️ Kafka disabled, no events will be consumed");
    }

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("═══════════════════════════════════════════════════════════════");

    // Wait for shutdown signal or service failure
    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_failure(&mut handles) => {
            warn!("⚠️ A service failed, initiating shutdown");
        }
    }

    // Graceful shutdown
    info!("🛑 Initiating graceful shutdown...");

    // Signal all services to stop
    let _ = shutdown_tx.send(());

    // Wait for services to finish with timeout
    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, shutdown_services(handles))
        .await
        .is_err()
    {
        warn!("⚠️ Shutdown timeout exceeded, forcing exit");
    }

    db.close().await;

    info!("👋 Copygram Recommendation Engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("copygram_engine=debug,copygram=debug,sqlx=warn,rdkafka=warn,info")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();
}

#[cfg(feature = "prometheus")]
fn install_metrics_exporter() -> Result<()> {
    let addr: std::net::SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
        .parse()
        .map_err(|e| copygram::Error::InvalidConfig {
            key: "METRICS_ADDR",
            message: format!("{}", e).into(),
        })?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| copygram::Error::config(format!("Failed to install metrics exporter: {}", e)))?;

    info!("📈 Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

/// Wait for any task to fail
async fn wait_for_any_failure(handles: &mut [tokio::task::JoinHandle<()>]) {
    loop {
        for handle in handles.iter_mut() {
            if handle.is_finished() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait for all services to complete shutdown
async fn shutdown_services(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
