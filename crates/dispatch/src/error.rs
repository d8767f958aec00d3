//! Command dispatch error types.

use events::BoxError;
use store::StoreError;
use thiserror::Error;

/// Configuration errors of the command registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered for this command type.
    #[error("Duplicate handler for command {0}")]
    DuplicateHandler(&'static str),

    /// No handler is registered for this command type.
    #[error("No handler registered for command {0}")]
    UnregisteredCommand(&'static str),
}

/// Errors returned to the caller of a command dispatch.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No handler is registered for this command type.
    #[error("No handler registered for command {0}")]
    UnregisteredCommand(&'static str),

    /// The handler rejected the command.
    #[error("Command {command_type} failed: {source}")]
    HandlerExecution {
        command_type: &'static str,
        #[source]
        source: BoxError,
    },

    /// The unit of work could not be started.
    #[error("Failed to begin transaction for {command_type}: {source}")]
    Begin {
        command_type: &'static str,
        #[source]
        source: StoreError,
    },

    /// The store failed to commit. No writes of the command were applied.
    #[error("Failed to commit {command_type}: {source}")]
    Commit {
        command_type: &'static str,
        #[source]
        source: StoreError,
    },

    /// A commit hook failed. The unit of work was rolled back.
    #[error("Commit hook {hook} failed for {command_type}: {source}")]
    PreCommit {
        command_type: &'static str,
        hook: String,
        #[source]
        source: BoxError,
    },

    /// Rolling back after `cause` failed as well.
    #[error("Rollback failed after '{cause}': {source}")]
    Rollback {
        #[source]
        source: StoreError,
        cause: Box<CommandError>,
    },

    /// The caller cancelled the dispatch before commit was requested.
    #[error("Command {command_type} cancelled before commit")]
    Cancelled { command_type: &'static str },
}

impl CommandError {
    /// Metric label for the dispatch outcome this error represents.
    pub fn outcome(&self) -> &'static str {
        match self {
            CommandError::UnregisteredCommand(_) => "unregistered",
            CommandError::HandlerExecution { .. } => "rolled_back",
            CommandError::Begin { .. } => "begin_failed",
            CommandError::PreCommit { .. } => "pre_commit_failed",
            CommandError::Commit { .. } => "commit_failed",
            CommandError::Rollback { .. } => "rollback_failed",
            CommandError::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns the handler's own error if this is (or was caused by) a
    /// business failure.
    pub fn handler_error(&self) -> Option<&BoxError> {
        match self {
            CommandError::HandlerExecution { source, .. } => Some(source),
            CommandError::Rollback { cause, .. } => cause.handler_error(),
            _ => None,
        }
    }
}

/// Result type for command dispatch.
pub type Result<T> = std::result::Result<T, CommandError>;
