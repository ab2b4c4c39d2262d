//! Fast-storage caches
//!
//! - `FastStore`: key-value + bounded-list contract with TTLs (Redis or in-process)
//! - `ConversationWindowCache`: per-user rolling history of the last `W` turns
//! - `ResultCache`: fingerprint-keyed image analysis results
//!
//! Every failure of the backing store degrades to "empty" / "miss".

pub mod keys;
mod memory_store;
mod redis_store;
mod result;
mod store;
mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use result::{CachedResult, ResultCache};
pub use store::{CacheError, FastStore};
pub use window::ConversationWindowCache;
