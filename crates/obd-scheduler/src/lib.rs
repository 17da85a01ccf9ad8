//! OBD-II Polling Manager
//!
//! Keeps a priority queue of catalog PIDs per driver and reads them on a
//! recurring timer, one cycle in flight at a time.

mod scheduler;

pub use scheduler::{
    PollFailure, PollReport, PollingConfig, PollingManager, PollingSinks, PollingStats, PollingTarget,
};
