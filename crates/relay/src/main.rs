//! Relay entry point.

use std::sync::Arc;

use messaging::{
    BrokerConfig, MessageBroker, MessageDispatcher, OutboxRelay, QueueDeadLetterSink, RedisQueue,
    RedisQueueConfig,
};
use relay::{Config, EventCounter, RelayError};
use store::PostgresStore;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> relay::Result<()> {
    // 1. Load configuration
    let config = Config::from_env()?;

    // 2. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 3. Install Prometheus metrics recorder and exporter
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
        .map_err(|e| RelayError::Metrics(e.to_string()))?;
    tracing::info!(addr = %config.metrics_addr, "metrics exporter listening");

    // 4. Connect to the queue backend
    let queue = RedisQueue::connect(RedisQueueConfig::new(config.redis_url.clone())).await?;
    let dead_letters = QueueDeadLetterSink::new(queue.clone(), config.dead_letter_queue.clone());

    // 5. Build the consumer
    let counter = EventCounter::new();
    let consumer = MessageDispatcher::new(
        queue.clone(),
        Arc::new(relay::integration_subscribers(counter.clone())),
        Arc::new(dead_letters),
        config.consumer_config(),
    );

    // 6. Run workers, and the outbox relay when a store is configured,
    //    until a shutdown signal arrives
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = relay::spawn_workers(&consumer, config.workers, &shutdown_rx);

    if let Some(database_url) = &config.database_url {
        let store = PostgresStore::connect(database_url).await?;
        store.ensure_outbox_table().await?;
        let broker = Arc::new(MessageBroker::new(
            queue,
            BrokerConfig::new(config.queue_name.clone()),
        ));
        let outbox = OutboxRelay::new(broker, Arc::new(store))
            .with_poll_interval(config.outbox_poll_interval);
        workers.push(relay::spawn_outbox_relay(Arc::new(outbox), &shutdown_rx));
        tracing::info!(
            poll_interval_ms = config.outbox_poll_interval.as_millis() as u64,
            "outbox relay enabled"
        );
    }

    tracing::info!(
        queue = %config.queue_name,
        dead_letter_queue = %config.dead_letter_queue,
        workers = config.workers,
        "relay started"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    relay::join_workers(workers).await?;

    tracing::info!(counts = ?counter.snapshot().await, "relay shut down gracefully");
    Ok(())
}
