//! Resource sampling for Mass Dispatch
//!
//! This crate measures CPU and memory pressure so the auto-scaler can size
//! the worker pool from live load.

mod monitor;

pub use monitor::{
    ManualProbe, ResourceProbe, ResourceSampler, ResourceThresholds, SysinfoProbe,
    DEFAULT_HISTORY_CAPACITY, MIN_SAMPLE_INTERVAL,
};
