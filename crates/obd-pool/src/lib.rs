//! OBD-II Connection Pool
//!
//! Shares a bounded number of ELM327 drivers between vehicles:
//! - FIFO wait queue with per-request timeout
//! - Lease guards that release on drop
//! - Background health checks that evict unresponsive adapters

mod factory;
mod pool;

pub use factory::{DriverFactory, TransportDriverFactory};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledDriver};
