//! Identifiers shared by the dispatch, event and messaging crates.

mod types;

pub use types::{ActorId, EventId, MessageId};
