//! Result Cache
//!
//! Bounded LRU cache with per-entry TTL, used for DTC descriptions and
//! recent PID values so repeated lookups skip the catalogs and the bus.

mod cache;

pub use cache::{CacheStats, ResultCache};
