//! Provider response parsing
//!
//! Success bodies come in three shapes: raw image bytes, JSON with base64
//! artifacts, or a JSON job handle that must be polled.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use common::error::{Error, Result};
use common::types::AsyncJobState;

use crate::transport::HttpResponse;

#[derive(Debug, Deserialize)]
struct EmbeddedEnvelope {
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Deserialize)]
struct Artifact {
    base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobHandle {
    urls: Option<JobUrls>,
}

#[derive(Debug, Deserialize)]
struct JobUrls {
    get: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatusBody {
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// One poll of an asynchronous job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: AsyncJobState,
    /// Where to fetch the image once the job succeeded
    pub output_url: Option<String>,
    /// Failure reason reported by the provider
    pub error: Option<String>,
}

fn invalid(provider: &str, message: impl Into<String>) -> Error {
    Error::InvalidResponse {
        provider: provider.to_string(),
        message: message.into(),
    }
}

/// Image bytes from a binary response
pub fn binary_image(provider: &str, response: &HttpResponse) -> Result<Bytes> {
    if response.body.is_empty() {
        return Err(invalid(provider, "empty image body"));
    }

    Ok(response.body.clone())
}

/// Decodes the first base64 artifact of a JSON response
pub fn embedded_image(provider: &str, response: &HttpResponse) -> Result<Bytes> {
    let envelope: EmbeddedEnvelope = response
        .parse()
        .map_err(|e| invalid(provider, format!("malformed artifact envelope: {}", e)))?;

    let encoded = envelope
        .artifacts
        .into_iter()
        .next()
        .and_then(|artifact| artifact.base64)
        .ok_or_else(|| invalid(provider, "response holds no artifacts"))?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid(provider, format!("artifact is not valid base64: {}", e)))?;

    if decoded.is_empty() {
        return Err(invalid(provider, "artifact is empty"));
    }

    Ok(Bytes::from(decoded))
}

/// Poll URL of a newly created asynchronous job
pub fn poll_url(provider: &str, response: &HttpResponse) -> Result<String> {
    let handle: JobHandle = response
        .parse()
        .map_err(|e| invalid(provider, format!("malformed job handle: {}", e)))?;

    handle
        .urls
        .and_then(|urls| urls.get)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| invalid(provider, "job handle has no poll URL"))
}

/// Parses a poll response
///
/// Unrecognised states count as still processing.
pub fn job_status(provider: &str, response: &HttpResponse) -> Result<JobStatus> {
    let body: JobStatusBody = response
        .parse()
        .map_err(|e| invalid(provider, format!("malformed job status: {}", e)))?;

    let state = body.status.parse().unwrap_or(AsyncJobState::Processing);

    // Output is a single URL or a list of them
    let output_url = match body.output {
        Some(Value::String(url)) => Some(url),
        Some(Value::Array(items)) => items.into_iter().find_map(|item| match item {
            Value::String(url) => Some(url),
            _ => None,
        }),
        _ => None,
    };

    let error = match body.error {
        Some(Value::String(message)) => Some(message),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };

    Ok(JobStatus {
        state,
        output_url,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embedded_image() {
        let response = HttpResponse::json(200, &json!({"artifacts": [{"base64": "iVBORw0K", "seed": 1}]}));
        assert_eq!(embedded_image("stability", &response).unwrap(), Bytes::from_static(b"\x89PNG\r\n"));

        let empty = HttpResponse::json(200, &json!({"artifacts": []}));
        assert!(matches!(
            embedded_image("stability", &empty),
            Err(Error::InvalidResponse { .. })
        ));

        let garbage = HttpResponse::json(200, &json!({"artifacts": [{"base64": "***"}]}));
        assert!(embedded_image("stability", &garbage).is_err());
    }

    #[test]
    fn test_poll_url() {
        let response = HttpResponse::json(201, &json!({"id": "p1", "urls": {"get": "https://api/p1"}}));
        assert_eq!(poll_url("replicate", &response).unwrap(), "https://api/p1");

        let missing = HttpResponse::json(201, &json!({"id": "p1"}));
        assert!(poll_url("replicate", &missing).is_err());
    }

    #[test]
    fn test_job_status_variants() {
        let listed = HttpResponse::json(
            200,
            &json!({"status": "succeeded", "output": ["https://cdn/a.png", "https://cdn/b.png"]}),
        );
        let status = job_status("replicate", &listed).unwrap();
        assert_eq!(status.state, AsyncJobState::Succeeded);
        assert_eq!(status.output_url.as_deref(), Some("https://cdn/a.png"));

        let single = HttpResponse::json(200, &json!({"status": "succeeded", "output": "https://cdn/c.png"}));
        assert_eq!(
            job_status("replicate", &single).unwrap().output_url.as_deref(),
            Some("https://cdn/c.png")
        );

        let failed = HttpResponse::json(200, &json!({"status": "failed", "error": "NSFW content"}));
        let status = job_status("replicate", &failed).unwrap();
        assert_eq!(status.state, AsyncJobState::Failed);
        assert_eq!(status.error.as_deref(), Some("NSFW content"));

        let starting = HttpResponse::json(200, &json!({"status": "starting", "output": null}));
        assert_eq!(job_status("replicate", &starting).unwrap().state, AsyncJobState::Queued);

        let odd = HttpResponse::json(200, &json!({"status": "warming"}));
        assert_eq!(job_status("replicate", &odd).unwrap().state, AsyncJobState::Processing);
    }

    #[test]
    fn test_binary_image_rejects_empty_body() {
        assert!(binary_image("huggingface", &HttpResponse::new(200, Bytes::new())).is_err());
        assert_eq!(
            binary_image("huggingface", &HttpResponse::new(200, "png")).unwrap(),
            Bytes::from_static(b"png")
        );
    }
}
