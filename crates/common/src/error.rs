//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by the dispatch workspace.
//! Provider-level kinds are absorbed by the dispatcher's retry loop; only
//! `GenerationFailed` is surfaced to callers of a generation.

use thiserror::Error;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP status returned by providers that throttle callers
pub const RATE_LIMIT_STATUS: u16 = 429;

/// Common error type for dispatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every provider is over quota, disabled, or missing credentials
    #[error("No provider available: all providers are over quota or uncredentialed")]
    NoProviderAvailable,

    /// The chosen provider has an empty credential pool
    #[error("No credential configured for provider {0}")]
    NoCredential(String),

    /// Non-success status or transport failure from a provider
    #[error("Request to provider {provider} failed{}: {message}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    ProviderRequestFailed {
        /// Provider identifier
        provider: String,
        /// HTTP status, `None` for transport errors
        status: Option<u16>,
        /// Response body excerpt or transport error text
        message: String,
    },

    /// The provider answered with a success status but an unusable body
    #[error("Invalid response from provider {provider}: {message}")]
    InvalidResponse {
        /// Provider identifier
        provider: String,
        /// What was wrong with the body
        message: String,
    },

    /// An asynchronous job reported a terminal failure
    #[error("Asynchronous job on provider {provider} failed: {reason}")]
    AsyncJobFailed {
        /// Provider identifier
        provider: String,
        /// Failure reason reported by the provider
        reason: String,
    },

    /// An asynchronous job did not finish within the poll budget
    #[error("Asynchronous job on provider {provider} timed out after {polls} polls")]
    AsyncJobTimeout {
        /// Provider identifier
        provider: String,
        /// Number of polls issued
        polls: u32,
    },

    /// All retries exhausted without producing an image
    #[error("Generation failed after {after_attempts} attempts{}", .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    GenerationFailed {
        /// Number of attempts made
        after_attempts: u32,
        /// Description of the last attempt failure
        last_error: Option<String>,
    },

    /// A request could not be built from the provider descriptor
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The worker pool no longer accepts work
    #[error("Worker pool is shut down")]
    PoolShutDown,

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the provider throttled the request
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Error::ProviderRequestFailed { status: Some(RATE_LIMIT_STATUS), .. }
        )
    }

    /// Returns true if the request never produced an HTTP status
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::ProviderRequestFailed { status: None, .. })
    }

    /// Returns true if the retry loop should wait before the next attempt
    pub fn should_back_off(&self) -> bool {
        self.is_rate_limited() || self.is_transport()
    }

    /// Returns true if a provider call was made and should be charged as a failure
    pub fn counts_as_provider_call(&self) -> bool {
        matches!(
            self,
            Error::ProviderRequestFailed { .. }
                | Error::InvalidResponse { .. }
                | Error::AsyncJobFailed { .. }
                | Error::AsyncJobTimeout { .. }
        )
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_failed(status: Option<u16>) -> Error {
        Error::ProviderRequestFailed {
            provider: "huggingface".to_string(),
            status,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_back_off_classification() {
        assert!(request_failed(Some(429)).is_rate_limited());
        assert!(request_failed(Some(429)).should_back_off());
        assert!(request_failed(None).is_transport());
        assert!(request_failed(None).should_back_off());
        assert!(!request_failed(Some(500)).should_back_off());
        assert!(!Error::NoProviderAvailable.should_back_off());
    }

    #[test]
    fn test_provider_call_accounting() {
        assert!(request_failed(Some(503)).counts_as_provider_call());
        assert!(Error::AsyncJobTimeout { provider: "replicate".into(), polls: 30 }.counts_as_provider_call());
        assert!(!Error::NoCredential("stability".into()).counts_as_provider_call());
        assert!(!Error::NoProviderAvailable.counts_as_provider_call());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            request_failed(Some(429)).to_string(),
            "Request to provider huggingface failed with status 429: boom"
        );
        assert_eq!(
            Error::GenerationFailed { after_attempts: 3, last_error: None }.to_string(),
            "Generation failed after 3 attempts"
        );
    }
}
