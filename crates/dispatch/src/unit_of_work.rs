//! The unit of work: one transaction and the events raised inside it.

use common::ActorId;
use events::{DomainEvent, EventEnvelope};
use store::{Store, StoreError};

/// Transactional scope of a single command dispatch.
///
/// A unit of work owns the store transaction and the ordered buffer of events
/// raised while it is open. It ends in exactly one of two ways:
/// [`commit`](Self::commit), which hands the buffered events back for release,
/// or [`rollback`](Self::rollback), which discards them. Both consume the
/// value, so a finished unit of work cannot be reused.
///
/// Dropping a unit of work without finishing it drops the transaction, which
/// the store treats as a rollback.
pub struct UnitOfWork<S: Store> {
    transaction: S::Transaction,
    events: Vec<EventEnvelope>,
    actor: Option<ActorId>,
}

impl<S: Store> UnitOfWork<S> {
    /// Opens a transaction and an empty event buffer.
    pub async fn begin(store: &S) -> Result<Self, StoreError> {
        let transaction = store.begin().await?;
        Ok(Self {
            transaction,
            events: Vec::new(),
            actor: None,
        })
    }

    /// Sets the actor stamped on events raised from now on.
    pub fn set_actor(&mut self, actor: ActorId) {
        self.actor = Some(actor);
    }

    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }

    /// Returns the store transaction.
    pub fn transaction(&self) -> &S::Transaction {
        &self.transaction
    }

    /// Returns the store transaction for writing.
    pub fn transaction_mut(&mut self) -> &mut S::Transaction {
        &mut self.transaction
    }

    /// Records a typed event.
    pub fn raise<E: DomainEvent>(&mut self, event: &E) -> Result<&EventEnvelope, serde_json::Error> {
        let envelope = EventEnvelope::from_event(event)?.build();
        Ok(self.raise_envelope(envelope))
    }

    /// Records an already built envelope.
    ///
    /// The envelope's sequence is overwritten with its position in this unit
    /// of work; the actor is filled in if the envelope has none.
    pub fn raise_envelope(&mut self, mut envelope: EventEnvelope) -> &EventEnvelope {
        envelope.sequence = self.events.len() as u64 + 1;
        if envelope.actor.is_none() {
            envelope.actor = self.actor.clone();
        }

        tracing::trace!(
            event_type = %envelope.event_type,
            sequence = envelope.sequence,
            "event raised"
        );

        self.events.push(envelope);
        &self.events[self.events.len() - 1]
    }

    /// Returns the events raised so far, in raise order.
    pub fn pending_events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// The open transaction next to the events raised so far.
    pub(crate) fn staging_parts(&mut self) -> (&mut S::Transaction, &[EventEnvelope]) {
        (&mut self.transaction, &self.events)
    }

    /// Commits the transaction and returns the buffered events.
    ///
    /// On failure the events are dropped.
    pub async fn commit(self, store: &S) -> Result<Vec<EventEnvelope>, StoreError> {
        store.commit(self.transaction).await?;
        Ok(self.events)
    }

    /// Rolls back the transaction and discards the buffered events.
    pub async fn rollback(self, store: &S) -> Result<(), StoreError> {
        let discarded = self.events.len();
        store.rollback(self.transaction).await?;
        tracing::debug!(discarded, "unit of work rolled back");
        Ok(())
    }
}
