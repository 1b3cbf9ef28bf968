//! Common types for Mass Dispatch
//!
//! This module defines small enums shared between the request builders and
//! the dispatcher.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// How a provider delivers the generated image on a success status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseShape {
    /// Body is the raw image
    Binary,
    /// Body is JSON with base64-encoded image data
    JsonEmbedded,
    /// Body is JSON pointing at a job that must be polled
    AsyncJob,
}

impl fmt::Display for ResponseShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseShape::Binary => write!(f, "binary"),
            ResponseShape::JsonEmbedded => write!(f, "json-embedded"),
            ResponseShape::AsyncJob => write!(f, "async-job"),
        }
    }
}

/// State reported by an asynchronous generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncJobState {
    /// Accepted but not started
    Queued,
    /// Running
    Processing,
    /// Finished with output
    Succeeded,
    /// Finished without output
    Failed,
}

impl fmt::Display for AsyncJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncJobState::Queued => write!(f, "queued"),
            AsyncJobState::Processing => write!(f, "processing"),
            AsyncJobState::Succeeded => write!(f, "succeeded"),
            AsyncJobState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for AsyncJobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" | "starting" => Ok(AsyncJobState::Queued),
            "processing" => Ok(AsyncJobState::Processing),
            "succeeded" => Ok(AsyncJobState::Succeeded),
            "failed" | "canceled" | "cancelled" => Ok(AsyncJobState::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_parsing() {
        assert_eq!("starting".parse::<AsyncJobState>(), Ok(AsyncJobState::Queued));
        assert_eq!("Succeeded".parse::<AsyncJobState>(), Ok(AsyncJobState::Succeeded));
        assert_eq!("canceled".parse::<AsyncJobState>(), Ok(AsyncJobState::Failed));
        assert!("exploded".parse::<AsyncJobState>().is_err());
    }
}
