//! Transactional dispatch: one unit of work per command.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use events::{DeliveryReport, EventDispatcher, EventEnvelope};
use store::{Store, StoreError};
use tracing::Instrument;

use crate::{
    Command, CommandError, CommitHook, CommandRegistry, InProcessDispatcher, Result, UnitOfWork,
};

/// Result of a committed dispatch, with the outcome of event release.
#[derive(Debug)]
pub struct Dispatched<T> {
    /// The handler's output.
    pub output: T,

    /// How the released events fared with their subscribers.
    pub report: DeliveryReport,
}

/// Wraps every dispatch in its own unit of work.
///
/// The protocol for each command:
/// 1. Begin a unit of work.
/// 2. Run the handler through the [`InProcessDispatcher`].
/// 3. On success, run the [`CommitHook`]s, which may add writes to the open
///    transaction.
/// 4. Commit, then hand the raised events in raise order to the domain
///    [`EventDispatcher`]. Delivery failures are reported and never undo the
///    commit.
/// 5. On any failure before commit, roll back and drop the raised events.
///
/// Commit and release run together on their own task: once the handler has
/// returned, the whole batch is committed and released even if the caller
/// stops waiting.
///
/// Commands dispatched from inside a handler through
/// [`CommandContext::dispatch`](crate::CommandContext::dispatch) join the
/// running unit of work.
pub struct TransactionalDispatcher<S: Store> {
    store: Arc<S>,
    inner: InProcessDispatcher<S>,
    events: Arc<EventDispatcher>,
    hooks: Vec<Arc<dyn CommitHook<S>>>,
}

impl<S: Store> Clone for TransactionalDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            inner: self.inner.clone(),
            events: Arc::clone(&self.events),
            hooks: self.hooks.clone(),
        }
    }
}

impl<S: Store> TransactionalDispatcher<S> {
    /// Creates a dispatcher over a store, a frozen registry and the domain
    /// event channel.
    pub fn new(store: Arc<S>, registry: CommandRegistry<S>, events: Arc<EventDispatcher>) -> Self {
        Self {
            store,
            inner: InProcessDispatcher::new(registry),
            events,
            hooks: Vec::new(),
        }
    }

    /// Adds a hook run before every commit, after those added earlier.
    pub fn with_commit_hook(mut self, hook: impl CommitHook<S> + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Dispatches a command and returns the handler's output.
    ///
    /// The caller only learns about the command itself; event delivery
    /// failures are logged.
    pub async fn dispatch<C: Command>(&self, command: C) -> Result<C::Output> {
        self.dispatch_until(command, std::future::pending())
            .await
            .map(|dispatched| dispatched.output)
    }

    /// Dispatches a command and also returns the release report.
    pub async fn dispatch_reported<C: Command>(&self, command: C) -> Result<Dispatched<C::Output>> {
        self.dispatch_until(command, std::future::pending()).await
    }

    /// Dispatches a command that is abandoned if `cancelled` resolves first.
    ///
    /// Cancellation is honoured only while the handler runs: the unit of
    /// work is rolled back and [`CommandError::Cancelled`] returned. Once the
    /// handler has returned, commit and release run to completion regardless.
    #[tracing::instrument(skip_all, fields(command_type = C::command_type()))]
    pub async fn dispatch_until<C, F>(&self, command: C, cancelled: F) -> Result<Dispatched<C::Output>>
    where
        C: Command,
        F: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        let result = self.run(command, cancelled).await;

        let outcome = match &result {
            Ok(_) => "committed",
            Err(error) => error.outcome(),
        };
        metrics::counter!(
            "commands_dispatched_total",
            "command_type" => C::command_type(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("command_dispatch_duration_seconds", "command_type" => C::command_type())
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(dispatched) => tracing::info!(
                released = dispatched.report.events,
                delivery_failures = dispatched.report.failures.len(),
                "command committed"
            ),
            Err(
                error @ (CommandError::HandlerExecution { .. } | CommandError::Cancelled { .. }),
            ) => tracing::info!(error = %error, "command rolled back"),
            Err(error) => tracing::error!(error = %error, "command dispatch failed"),
        }

        result
    }

    async fn run<C, F>(&self, command: C, cancelled: F) -> Result<Dispatched<C::Output>>
    where
        C: Command,
        F: Future<Output = ()> + Send,
    {
        let command_type = C::command_type();

        let mut uow = UnitOfWork::begin(&*self.store)
            .await
            .map_err(|source| CommandError::Begin {
                command_type,
                source,
            })?;
        if let Some(actor) = command.actor() {
            uow.set_actor(actor.clone());
        }

        let handled = {
            let handler = self.inner.dispatch(command, &mut uow);
            tokio::pin!(cancelled);
            tokio::select! {
                biased;
                () = &mut cancelled => Err(CommandError::Cancelled { command_type }),
                result = handler => result,
            }
        };

        let output = match handled {
            Ok(output) => output,
            Err(error) => return Err(self.abandon(uow, error).await),
        };
        if let Err(error) = self.run_hooks(&mut uow, command_type).await {
            return Err(self.abandon(uow, error).await);
        }

        let store = Arc::clone(&self.store);
        let channel = Arc::clone(&self.events);
        let finish = tokio::spawn(
            async move {
                let events = uow
                    .commit(&*store)
                    .await
                    .map_err(|source| CommandError::Commit {
                        command_type,
                        source,
                    })?;
                Ok::<_, CommandError>(release(&channel, &events).await)
            }
            .in_current_span(),
        );

        let report = match finish.await {
            Ok(result) => result?,
            Err(join_error) => {
                return Err(CommandError::Commit {
                    command_type,
                    source: StoreError::Interrupted(join_error.to_string()),
                });
            }
        };
        Ok(Dispatched { output, report })
    }

    async fn run_hooks(&self, uow: &mut UnitOfWork<S>, command_type: &'static str) -> Result<()> {
        let (transaction, events) = uow.staging_parts();
        for hook in &self.hooks {
            hook.before_commit(&*self.store, transaction, events)
                .await
                .map_err(|source| CommandError::PreCommit {
                    command_type,
                    hook: hook.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Rolls back after `error`, keeping it as the cause if rollback fails too.
    async fn abandon(&self, uow: UnitOfWork<S>, error: CommandError) -> CommandError {
        match uow.rollback(&*self.store).await {
            Ok(()) => error,
            Err(source) => CommandError::Rollback {
                source,
                cause: Box::new(error),
            },
        }
    }
}

/// Hands committed events to the domain channel, in order.
#[tracing::instrument(skip_all, fields(channel = channel.channel(), events = events.len()))]
async fn release(channel: &EventDispatcher, events: &[EventEnvelope]) -> DeliveryReport {
    let report = channel.dispatch_batch(events).await;
    metrics::counter!("events_released_total").increment(events.len() as u64);

    for failure in &report.failures {
        tracing::warn!(
            error = %failure,
            "event delivery failed after commit; command stays committed"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandContext, CommandHandler, CommitHook};
    use async_trait::async_trait;
    use events::{BoxError, DomainEvent, EventSubscriber};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use store::InMemoryStore;
    use tokio::sync::{Mutex, oneshot};

    #[derive(Debug, Serialize, Deserialize)]
    struct Reserved {
        slot: u32,
    }

    impl DomainEvent for Reserved {
        fn event_type(&self) -> &'static str {
            "Reserved"
        }

        fn identity(&self) -> Option<String> {
            Some(self.slot.to_string())
        }
    }

    /// Reserves slots; fails if any slot is zero.
    struct Reserve(Vec<u32>);

    impl Command for Reserve {
        type Output = usize;

        fn command_type() -> &'static str {
            "Reserve"
        }
    }

    struct ReserveHandler;

    #[async_trait]
    impl CommandHandler<Reserve, InMemoryStore> for ReserveHandler {
        async fn handle(
            &self,
            command: Reserve,
            ctx: &mut CommandContext<'_, InMemoryStore>,
        ) -> std::result::Result<usize, BoxError> {
            for slot in &command.0 {
                ctx.transaction_mut()
                    .put(format!("slot:{slot}"), &true)?;
                ctx.raise(&Reserved { slot: *slot })?;
                if *slot == 0 {
                    return Err("slot zero is not bookable".into());
                }
            }
            Ok(command.0.len())
        }
    }

    /// Blocks in the handler until released.
    struct Stall;

    impl Command for Stall {
        type Output = ();

        fn command_type() -> &'static str {
            "Stall"
        }
    }

    struct StallHandler;

    #[async_trait]
    impl CommandHandler<Stall, InMemoryStore> for StallHandler {
        async fn handle(
            &self,
            _command: Stall,
            ctx: &mut CommandContext<'_, InMemoryStore>,
        ) -> std::result::Result<(), BoxError> {
            ctx.transaction_mut().put_raw("stalled", serde_json::json!(true));
            ctx.raise(&Reserved { slot: 42 })?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    /// Records what it sees and whether the write was already committed.
    struct CommitWitness {
        store: InMemoryStore,
        seen: Arc<Mutex<Vec<(u64, bool)>>>,
    }

    #[async_trait]
    impl EventSubscriber for CommitWitness {
        fn name(&self) -> &str {
            "commit-witness"
        }

        async fn on_event(&self, event: &EventEnvelope) -> std::result::Result<(), BoxError> {
            let key = format!("slot:{}", event.identity);
            let committed = self.store.get(&key).await.is_some();
            self.seen.lock().await.push((event.sequence, committed));
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventSubscriber for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn on_event(&self, _event: &EventEnvelope) -> std::result::Result<(), BoxError> {
            Err("downstream unavailable".into())
        }
    }

    struct Harness {
        store: InMemoryStore,
        seen: Arc<Mutex<Vec<(u64, bool)>>>,
        dispatcher: TransactionalDispatcher<InMemoryStore>,
    }

    fn harness(with_failing_subscriber: bool) -> Harness {
        let store = InMemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut builder = EventDispatcher::builder("domain");
        if with_failing_subscriber {
            builder = builder.subscribe("Reserved", AlwaysFails);
        }
        let events = builder
            .subscribe(
                "Reserved",
                CommitWitness {
                    store: store.clone(),
                    seen: Arc::clone(&seen),
                },
            )
            .build();

        let registry = CommandRegistry::new()
            .with::<Reserve, _>(ReserveHandler)
            .unwrap()
            .with::<Stall, _>(StallHandler)
            .unwrap();

        Harness {
            dispatcher: TransactionalDispatcher::new(
                Arc::new(store.clone()),
                registry,
                Arc::new(events),
            ),
            store,
            seen,
        }
    }

    #[tokio::test]
    async fn test_events_are_released_in_order_after_commit() {
        let h = harness(false);

        let reserved = h.dispatcher.dispatch(Reserve(vec![1, 2, 3])).await.unwrap();

        assert_eq!(reserved, 3);
        assert_eq!(
            *h.seen.lock().await,
            vec![(1, true), (2, true), (3, true)]
        );
        assert_eq!(h.store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_rolls_back_and_releases_nothing() {
        let h = harness(false);

        let error = h.dispatcher.dispatch(Reserve(vec![1, 0])).await.unwrap_err();

        assert!(matches!(error, CommandError::HandlerExecution { .. }));
        assert!(h.seen.lock().await.is_empty());
        assert!(h.store.is_empty().await);
        assert_eq!(h.store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_releases_nothing() {
        let h = harness(false);
        h.store.fail_next_commits(1);

        let error = h.dispatcher.dispatch(Reserve(vec![1])).await.unwrap_err();

        assert!(matches!(error, CommandError::Commit { command_type: "Reserve", .. }));
        assert!(h.seen.lock().await.is_empty());
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_begin_failure() {
        let h = harness(false);
        h.store.fail_next_begins(1);

        let error = h.dispatcher.dispatch(Reserve(vec![1])).await.unwrap_err();

        assert!(matches!(error, CommandError::Begin { .. }));
        assert_eq!(h.store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_handler_error_as_cause() {
        let h = harness(false);
        h.store.fail_next_rollbacks(1);

        let error = h.dispatcher.dispatch(Reserve(vec![0])).await.unwrap_err();

        match &error {
            CommandError::Rollback { cause, .. } => {
                assert!(matches!(**cause, CommandError::HandlerExecution { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            error.handler_error().map(|e| e.to_string()),
            Some("slot zero is not bookable".to_string())
        );
        assert!(h.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_undo_commit() {
        let h = harness(true);

        let dispatched = h
            .dispatcher
            .dispatch_reported(Reserve(vec![7]))
            .await
            .unwrap();

        assert_eq!(dispatched.output, 1);
        assert_eq!(dispatched.report.failures.len(), 1);
        assert_eq!(dispatched.report.delivered, 1);
        assert!(h.store.get("slot:7").await.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_before_commit_rolls_back() {
        let h = harness(false);
        let (cancel, cancelled) = oneshot::channel::<()>();

        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch_until(Stall, async {
                    let _ = cancelled.await;
                })
                .await
        });

        tokio::task::yield_now().await;
        cancel.send(()).unwrap();
        let error = task.await.unwrap().unwrap_err();

        assert!(matches!(error, CommandError::Cancelled { command_type: "Stall" }));
        assert!(h.store.is_empty().await);
        assert!(h.seen.lock().await.is_empty());
        assert_eq!(h.store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_use_separate_units_of_work() {
        let h = harness(false);

        let (a, b) = tokio::join!(
            h.dispatcher.dispatch(Reserve(vec![1, 2])),
            h.dispatcher.dispatch(Reserve(vec![3, 0])),
        );

        assert_eq!(a.unwrap(), 2);
        assert!(b.is_err());
        assert!(h.store.get("slot:1").await.is_some());
        assert!(h.store.get("slot:3").await.is_none());
        assert_eq!(h.seen.lock().await.len(), 2);
    }

    /// Takes a while per event and records the sequences it saw.
    struct SlowSubscriber {
        delay: Duration,
        released: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl EventSubscriber for SlowSubscriber {
        fn name(&self) -> &str {
            "slow"
        }

        async fn on_event(&self, event: &EventEnvelope) -> std::result::Result<(), BoxError> {
            tokio::time::sleep(self.delay).await;
            self.released.lock().await.push(event.sequence);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_still_releases_whole_batch() {
        let store = InMemoryStore::new();
        let released = Arc::new(Mutex::new(Vec::new()));
        let events = EventDispatcher::builder("domain")
            .subscribe(
                "Reserved",
                SlowSubscriber {
                    delay: Duration::from_secs(2),
                    released: Arc::clone(&released),
                },
            )
            .build();
        let registry = CommandRegistry::new()
            .with::<Reserve, _>(ReserveHandler)
            .unwrap();
        let dispatcher =
            TransactionalDispatcher::new(Arc::new(store.clone()), registry, Arc::new(events));

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch(Reserve(vec![1, 2, 3])),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*released.lock().await, vec![1, 2, 3]);
        assert_eq!(store.commit_count(), 1);
        assert!(store.get("slot:3").await.is_some());
    }

    /// Writes one audit row per raised event into the open transaction.
    struct AuditTrail {
        fail: bool,
    }

    #[async_trait]
    impl CommitHook<InMemoryStore> for AuditTrail {
        fn name(&self) -> &str {
            "audit-trail"
        }

        async fn before_commit(
            &self,
            _store: &InMemoryStore,
            transaction: &mut store::InMemoryTransaction,
            events: &[EventEnvelope],
        ) -> std::result::Result<(), BoxError> {
            if self.fail {
                return Err("audit table locked".into());
            }
            for event in events {
                transaction.put(format!("audit:{}", event.sequence), &event.event_type)?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_hook_writes_commit_with_the_command() {
        let h = harness(false);
        let dispatcher = h.dispatcher.clone().with_commit_hook(AuditTrail { fail: false });

        dispatcher.dispatch(Reserve(vec![4, 5])).await.unwrap();

        assert!(h.store.get("audit:1").await.is_some());
        assert!(h.store.get("audit:2").await.is_some());
        assert_eq!(h.store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_commit_hook_rolls_back_and_releases_nothing() {
        let h = harness(false);
        let dispatcher = h.dispatcher.clone().with_commit_hook(AuditTrail { fail: true });

        let error = dispatcher.dispatch(Reserve(vec![4])).await.unwrap_err();

        assert!(matches!(
            &error,
            CommandError::PreCommit { hook, .. } if hook == "audit-trail"
        ));
        assert_eq!(error.outcome(), "pre_commit_failed");
        assert!(h.store.is_empty().await);
        assert!(h.seen.lock().await.is_empty());
        assert_eq!(h.store.rollback_count(), 1);
    }
}
