//! Command and handler traits.

use async_trait::async_trait;
use common::ActorId;
use events::BoxError;
use store::Store;

use crate::CommandContext;

/// Trait for commands.
///
/// Commands represent an intention to change state. They are plain values:
/// never persisted and identified only by their type.
pub trait Command: Send + Sync + 'static {
    /// The value a successful handler returns to the caller.
    type Output: Send + 'static;

    /// Returns the command type name, used in errors, logs and metrics.
    fn command_type() -> &'static str;

    /// Returns the actor on whose behalf the command is issued, if known.
    ///
    /// Events raised while handling the command are stamped with it.
    fn actor(&self) -> Option<&ActorId> {
        None
    }
}

/// Handler for one command type.
///
/// The handler performs its writes through the transaction of the active
/// unit of work and records events with [`CommandContext::raise`]. It must
/// not commit, roll back or publish anything itself; the transactional
/// dispatcher does that once the handler returns.
#[async_trait]
pub trait CommandHandler<C: Command, S: Store>: Send + Sync + 'static {
    /// Executes the command.
    async fn handle(
        &self,
        command: C,
        ctx: &mut CommandContext<'_, S>,
    ) -> Result<C::Output, BoxError>;
}
