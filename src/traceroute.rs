//! TTL sweeps towards a destination

pub mod result;
pub mod sweeper;
pub mod types;

// Re-export commonly used types
pub use result::TracerouteSession;
pub use sweeper::{HopSweeper, SweepPlan};
pub use types::{HopResult, SweepMode};
