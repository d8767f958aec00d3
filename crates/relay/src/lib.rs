//! Queue consumer service.
//!
//! Runs [`MessageDispatcher`] workers against the durable queue and hands
//! each integration event to the relay's subscribers. Poison messages are
//! moved to a dead-letter queue. With an outbox store configured, an
//! [`OutboxRelay`] publishes the messages producers committed to it.

pub mod config;
pub mod counter;
pub mod error;

pub use config::Config;
pub use counter::EventCounter;
pub use error::{ConfigError, RelayError, Result};

use std::sync::Arc;

use events::{Deduplicate, EventDispatcher};
use messaging::{MessageDispatcher, OutboxRelay, QueueClient};
use store::OutboxStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Builds the integration channel the workers deliver to.
pub fn integration_subscribers(counter: EventCounter) -> EventDispatcher {
    EventDispatcher::builder("integration")
        .subscribe_all(Deduplicate::new(counter))
        .build()
}

/// Spawns `workers` consumer tasks sharing one dispatcher.
///
/// Every task stops once `shutdown` turns true; the message it is working on
/// is finished first.
pub fn spawn_workers<Q>(
    consumer: &MessageDispatcher<Q>,
    workers: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    Q: QueueClient + Clone + 'static,
{
    (0..workers)
        .map(|worker| {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            let span = tracing::info_span!("worker", worker);

            tokio::spawn(
                async move {
                    metrics::gauge!("consumer_workers_running").increment(1.0);
                    consumer.run(shutdown).await;
                    metrics::gauge!("consumer_workers_running").decrement(1.0);
                }
                .instrument(span),
            )
        })
        .collect()
}

/// Spawns the task publishing pending outbox records until `shutdown`.
pub fn spawn_outbox_relay<Q, S>(
    relay: Arc<OutboxRelay<Q, S>>,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<()>
where
    Q: QueueClient + 'static,
    S: OutboxStore,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move { relay.run(shutdown).await }.instrument(tracing::info_span!("outbox")))
}

/// Waits for every worker to stop.
pub async fn join_workers(handles: Vec<JoinHandle<()>>) -> Result<()> {
    for handle in handles {
        handle.await?;
    }
    Ok(())
}
