//! Handler resolution and invocation.

use std::sync::Arc;

use common::ActorId;
use events::{DomainEvent, EventEnvelope};
use store::Store;

use crate::{Command, CommandError, CommandRegistry, Result, UnitOfWork};

/// Resolves the handler of a command and runs it inside a given unit of work.
///
/// It has no transaction semantics of its own: the caller owns the unit of
/// work and decides whether to commit it. See
/// [`TransactionalDispatcher`](crate::TransactionalDispatcher).
pub struct InProcessDispatcher<S: Store> {
    registry: Arc<CommandRegistry<S>>,
}

impl<S: Store> Clone for InProcessDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: Store> InProcessDispatcher<S> {
    /// Freezes the registry and creates a dispatcher over it.
    pub fn new(registry: CommandRegistry<S>) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &CommandRegistry<S> {
        &self.registry
    }

    /// Runs the handler of `command` against `uow`.
    ///
    /// Handler errors are returned as [`CommandError::HandlerExecution`].
    pub async fn dispatch<C: Command>(
        &self,
        command: C,
        uow: &mut UnitOfWork<S>,
    ) -> Result<C::Output> {
        let handler = self
            .registry
            .resolve::<C>()
            .map_err(|_| CommandError::UnregisteredCommand(C::command_type()))?;

        let mut ctx = CommandContext {
            uow,
            dispatcher: self,
        };

        tracing::debug!(command_type = C::command_type(), "invoking command handler");

        handler
            .handle(command, &mut ctx)
            .await
            .map_err(|source| CommandError::HandlerExecution {
                command_type: C::command_type(),
                source,
            })
    }
}

/// What a handler sees of the dispatch it runs in.
///
/// Gives access to the active transaction, lets the handler raise events
/// and dispatch further commands into the same unit of work.
pub struct CommandContext<'a, S: Store> {
    uow: &'a mut UnitOfWork<S>,
    dispatcher: &'a InProcessDispatcher<S>,
}

impl<S: Store> CommandContext<'_, S> {
    /// Returns the store transaction.
    pub fn transaction(&self) -> &S::Transaction {
        self.uow.transaction()
    }

    /// Returns the store transaction for writing.
    pub fn transaction_mut(&mut self) -> &mut S::Transaction {
        self.uow.transaction_mut()
    }

    /// Records an event for release after commit.
    pub fn raise<E: DomainEvent>(&mut self, event: &E) -> std::result::Result<(), serde_json::Error> {
        self.uow.raise(event)?;
        Ok(())
    }

    /// Records an already built envelope for release after commit.
    pub fn raise_envelope(&mut self, envelope: EventEnvelope) {
        self.uow.raise_envelope(envelope);
    }

    /// Returns the actor of the dispatch, if any.
    pub fn actor(&self) -> Option<&ActorId> {
        self.uow.actor()
    }

    /// Returns the events raised so far in this unit of work.
    pub fn pending_events(&self) -> &[EventEnvelope] {
        self.uow.pending_events()
    }

    /// Dispatches another command in the current unit of work.
    ///
    /// No new transaction is opened: both commands commit or roll back
    /// together and their events are released as one batch. If the nested
    /// command fails and the outer handler recovers from the error, the
    /// nested command's writes and events stay in the unit of work.
    pub async fn dispatch<C: Command>(&mut self, command: C) -> Result<C::Output> {
        tracing::debug!(command_type = C::command_type(), "nested dispatch");
        self.dispatcher.dispatch(command, &mut *self.uow).await
    }
}
