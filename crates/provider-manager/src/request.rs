//! Typed request builders
//!
//! Each provider variant produces a validated request: endpoint URL, headers,
//! JSON body, and the shape its success response will take.

use serde_json::{json, Value};

use common::error::{Error, Result};
use common::models::{ProviderDescriptor, ProviderKind};
use common::types::ResponseShape;

/// A ready-to-send provider request
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Endpoint URL
    pub url: String,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Value,
    /// How the success response delivers the image
    pub shape: ResponseShape,
}

impl ProviderRequest {
    /// Builds the request for `prompt` on `model`
    pub fn build(
        descriptor: &ProviderDescriptor,
        prompt: &str,
        model: &str,
        credential: Option<&str>,
    ) -> Result<Self> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("Prompt must not be empty".to_string()));
        }

        if model.trim().is_empty() {
            return Err(Error::InvalidRequest(format!("Provider {} was given an empty model", descriptor.id)));
        }

        let credential = credential.filter(|c| !c.trim().is_empty());
        if descriptor.requires_auth && credential.is_none() {
            return Err(Error::InvalidRequest(format!("Provider {} requires a credential", descriptor.id)));
        }

        let base = descriptor.base_url.trim_end_matches('/');
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        let (url, scheme, body, shape) = match &descriptor.kind {
            ProviderKind::Huggingface(options) => {
                check_dimensions(&descriptor.id, options.width, options.height)?;

                let body = json!({
                    "inputs": prompt,
                    "parameters": {
                        "negative_prompt": options.negative_prompt,
                        "num_inference_steps": options.num_inference_steps,
                        "guidance_scale": options.guidance_scale,
                        "width": options.width,
                        "height": options.height,
                    }
                });

                (format!("{}/{}", base, model), "Bearer", body, ResponseShape::Binary)
            }
            ProviderKind::Replicate(options) => {
                check_dimensions(&descriptor.id, options.width, options.height)?;

                // The version hash pins the model
                let body = json!({
                    "version": options.version,
                    "input": {
                        "prompt": prompt,
                        "negative_prompt": options.negative_prompt,
                        "width": options.width,
                        "height": options.height,
                        "num_outputs": options.num_outputs,
                        "num_inference_steps": options.num_inference_steps,
                    }
                });

                (base.to_string(), "Token", body, ResponseShape::AsyncJob)
            }
            ProviderKind::StabilityAi(options) => {
                check_dimensions(&descriptor.id, options.width, options.height)?;

                let body = json!({
                    "text_prompts": [{ "text": prompt, "weight": 1 }],
                    "cfg_scale": options.cfg_scale,
                    "height": options.height,
                    "width": options.width,
                    "samples": options.samples,
                    "steps": options.steps,
                });

                headers.push(("Accept".to_string(), "application/json".to_string()));

                (
                    format!("{}/{}/text-to-image", base, model),
                    "Bearer",
                    body,
                    ResponseShape::JsonEmbedded,
                )
            }
        };

        if let Some(credential) = credential {
            headers.push(("Authorization".to_string(), format!("{} {}", scheme, credential)));
        }

        Ok(Self {
            url,
            headers,
            body,
            shape,
        })
    }

    /// Looks up a header value, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Headers to reuse when polling an asynchronous job
    pub fn auth_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("Authorization"))
            .cloned()
            .collect()
    }
}

fn check_dimensions(provider_id: &str, width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidRequest(format!(
            "Provider {} has invalid image size {}x{}",
            provider_id, width, height
        )));
    }

    Ok(())
}
