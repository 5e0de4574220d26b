//! Read-path caching with offline fallback.
//!
//! This module provides a partitioned response cache that:
//! - Serves static shell assets cache-first
//! - Serves API reads network-first with a bounded wait, falling back to the
//!   last cached response for the exact URL
//! - Expires entries by age and caps partitions by entry count
//! - Drops partitions left over from previous versions

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{request_key, CachePolicy, CacheResult, CacheSource};
