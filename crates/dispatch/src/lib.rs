//! Command dispatch for the booking backend.
//!
//! This crate provides:
//! - [`Command`] and [`CommandHandler`] traits
//! - [`CommandRegistry`], the one-handler-per-command-type table built at startup
//! - [`InProcessDispatcher`], which resolves and invokes handlers
//! - [`UnitOfWork`], the transaction plus the buffer of raised events
//! - [`TransactionalDispatcher`], which commits or rolls back each dispatch and
//!   releases the buffered events only after a durable commit
//! - [`CommitHook`], for writes that must commit together with the command

pub mod command;
pub mod dispatcher;
pub mod error;
pub mod hook;
pub mod registry;
pub mod transactional;
pub mod unit_of_work;

pub use command::{Command, CommandHandler};
pub use dispatcher::{CommandContext, InProcessDispatcher};
pub use error::{CommandError, RegistryError, Result};
pub use hook::CommitHook;
pub use events::BoxError;
pub use registry::CommandRegistry;
pub use transactional::{Dispatched, TransactionalDispatcher};
pub use unit_of_work::UnitOfWork;
