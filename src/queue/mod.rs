//! Durable queue of order submissions awaiting replay.

mod store;
mod types;

pub use store::{QueueStore, SqliteQueueStore};
pub use types::{DeadLetter, QueuedRequest, StoredRequest};
