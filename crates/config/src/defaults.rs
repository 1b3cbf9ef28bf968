//! Built-in default settings

use std::collections::HashMap;

use serde_json::{json, Value};

/// Default configuration values
pub struct DefaultConfig;

impl DefaultConfig {
    /// All default settings keyed by their dotted name
    pub fn values() -> HashMap<String, Value> {
        let defaults = [
            // Resource sampling
            ("sampler.interval", json!("5s")),
            ("sampler.history_capacity", json!(100)),
            ("sampler.stop_timeout", json!("5s")),
            // Scaling
            ("scaling.enabled", json!(true)),
            ("scaling.base_workers", json!(4)),
            ("scaling.cpu_threshold_percent", json!(80.0)),
            ("scaling.memory_threshold_percent", json!(80.0)),
            ("scaling.history_capacity", json!(50)),
            // Dispatch
            ("dispatcher.max_retries", json!(3)),
            ("dispatcher.retry_delay", json!("2s")),
            ("dispatcher.poll_interval", json!("2s")),
            ("dispatcher.max_poll_attempts", json!(30)),
            ("dispatcher.request_timeout", json!("60s")),
            // Worker pool
            ("pool.shutdown_grace", json!("30s")),
            // Providers
            ("providers.credentials_dir", json!("api_keys")),
            // Logging
            ("logging.level", json!("info")),
            ("logging.format", json!("human")),
        ];

        defaults
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}
