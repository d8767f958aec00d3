//! Command type to handler table.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use std::sync::Arc;

use store::Store;

use crate::{Command, CommandHandler, RegistryError};

struct Registration {
    command_type: &'static str,
    /// Holds an `Arc<dyn CommandHandler<C, S>>` for the registered `C`.
    handler: Box<dyn Any + Send + Sync>,
}

/// Maps each command type to exactly one handler.
///
/// Filled once at startup and then moved into an [`InProcessDispatcher`],
/// after which it is only read.
///
/// [`InProcessDispatcher`]: crate::InProcessDispatcher
pub struct CommandRegistry<S: Store> {
    handlers: HashMap<TypeId, Registration>,
    _store: PhantomData<fn() -> S>,
}

impl<S: Store> CommandRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            _store: PhantomData,
        }
    }

    /// Registers the handler for command type `C`.
    ///
    /// Fails with [`RegistryError::DuplicateHandler`] if `C` already has one.
    pub fn register<C, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        C: Command,
        H: CommandHandler<C, S>,
    {
        match self.handlers.entry(TypeId::of::<C>()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateHandler(C::command_type())),
            Entry::Vacant(slot) => {
                let handler: Arc<dyn CommandHandler<C, S>> = Arc::new(handler);
                slot.insert(Registration {
                    command_type: C::command_type(),
                    handler: Box::new(handler),
                });
                tracing::debug!(command_type = C::command_type(), "command handler registered");
                Ok(())
            }
        }
    }

    /// Chaining form of [`register`](Self::register).
    pub fn with<C, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        C: Command,
        H: CommandHandler<C, S>,
    {
        self.register::<C, H>(handler)?;
        Ok(self)
    }

    /// Returns the handler for command type `C`.
    pub fn resolve<C: Command>(&self) -> Result<Arc<dyn CommandHandler<C, S>>, RegistryError> {
        self.handlers
            .get(&TypeId::of::<C>())
            .and_then(|registration| {
                registration
                    .handler
                    .downcast_ref::<Arc<dyn CommandHandler<C, S>>>()
            })
            .cloned()
            .ok_or(RegistryError::UnregisteredCommand(C::command_type()))
    }

    /// Returns true if command type `C` has a handler.
    pub fn contains<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// Returns the registered command type names, sorted.
    pub fn command_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.values().map(|r| r.command_type).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S: Store> Default for CommandRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
