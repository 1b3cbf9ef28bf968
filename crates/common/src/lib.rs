//! Common utilities and types for Mass Dispatch
//!
//! This crate provides shared functionality used across the dispatch workspace,
//! including the error taxonomy, the shared data model, and small utilities.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
pub use types::*;
