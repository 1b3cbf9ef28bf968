//! Load-driven worker scaling for Mass Dispatch
//!
//! This crate turns CPU/memory readings and backlog depth into a worker
//! count, and records every change it makes.

pub mod policy;
pub mod scaler;

// Re-export commonly used types
pub use policy::ScalingPolicy;
pub use scaler::{AutoScaler, DEFAULT_SCALING_HISTORY};
