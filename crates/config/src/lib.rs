//! Configuration management for Mass Dispatch
//!
//! This crate provides the layered settings store and the loaders for the
//! provider catalog and per-provider credential files.

pub mod defaults;
pub mod manager;
pub mod providers;

// Re-export commonly used types
pub use defaults::DefaultConfig;
pub use manager::{ConfigManager, ENV_PREFIX, ENV_SEPARATOR};
pub use providers::{default_provider_catalog, load_credentials, load_provider_catalog, CredentialFile};
