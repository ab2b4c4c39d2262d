//! Durable interaction history with an async queue
//!
//! The response path only ever calls `HistorySink::enqueue` / `touch`; batch
//! writes to the `InteractionStore` happen on background workers.

mod sink;
mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use sink::{HistorySink, QueuedHistorySink};
pub use store::{InteractionStore, PersistenceError};
pub use types::{
    HistoryEvent, InteractionKind, InteractionRecord, InteractionRecordBuilder, UserActivity,
};
