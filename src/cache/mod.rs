//! Versioned response cache.
//!
//! A storage holds named generations of request -> response snapshots. The
//! [`CacheLayer`] binds one generation as current and implements the
//! network-first and stale-while-revalidate strategies on top of it.

mod entry;
mod layer;
mod storage;
mod traits;

pub use entry::RequestKey;
pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
