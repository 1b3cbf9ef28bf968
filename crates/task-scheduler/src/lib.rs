//! Worker pool for Mass Dispatch
//!
//! The pool runs generation jobs with bounded concurrency. Its size is
//! re-evaluated by the auto-scaler before every admission, and it resizes
//! live: growing adds capacity at once, shrinking retires capacity as
//! running jobs finish.

mod job;
mod pool;

pub use job::{BatchResults, JobHandle, PoolStats};
pub use pool::{PoolState, WorkerPool, DEFAULT_SHUTDOWN_GRACE};
