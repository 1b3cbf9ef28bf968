//! Generation dispatcher
//!
//! `generate` runs a bounded retry loop. Each attempt selects a provider,
//! takes the next credential, builds the provider's request for a randomly
//! chosen model, sends it and interprets the response. Everything that goes
//! wrong inside an attempt is absorbed by the loop; callers only ever see
//! `GenerationFailed` once all attempts are spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, error, trace, warn};

use common::error::{Error, Result};
use common::models::{GeneratedImage, Job, ProviderDescriptor};
use common::types::{AsyncJobState, ResponseShape};
use common::utils::format_duration;
use config::ConfigManager;
use provider_manager::{ProviderRegistry, ProviderRequest};

use crate::response;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Something that can turn a job into an image
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generates an image for `job`, updating `job.attempt` as attempts are made
    async fn generate_job(&self, job: &mut Job) -> Result<GeneratedImage>;
}

/// Retry and polling settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Attempts per generation
    pub max_retries: u32,
    /// Backoff unit, multiplied by the attempt number
    pub retry_delay: Duration,
    /// Wait before each poll of an asynchronous job
    pub poll_interval: Duration,
    /// Polls before an asynchronous job is given up on
    pub max_poll_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 30,
        }
    }
}

impl DispatcherConfig {
    /// Reads the `dispatcher.*` settings, falling back to defaults
    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            max_retries: config_manager
                .get_u32("dispatcher.max_retries")
                .unwrap_or(defaults.max_retries),
            retry_delay: config_manager
                .get_duration("dispatcher.retry_delay")
                .unwrap_or(defaults.retry_delay),
            poll_interval: config_manager
                .get_duration("dispatcher.poll_interval")
                .unwrap_or(defaults.poll_interval),
            max_poll_attempts: config_manager
                .get_u32("dispatcher.max_poll_attempts")
                .unwrap_or(defaults.max_poll_attempts),
        })
    }
}

/// Sends generation requests to providers
pub struct Dispatcher {
    /// Provider catalog and usage ledgers
    registry: Arc<ProviderRegistry>,

    /// HTTP transport
    transport: Arc<dyn HttpTransport>,

    /// Retry and polling settings
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Creates a new dispatcher
    pub fn new(registry: Arc<ProviderRegistry>, transport: Arc<dyn HttpTransport>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            transport,
            config,
        }
    }

    /// Creates a dispatcher on a `reqwest` transport configured from `dispatcher.*`
    pub fn from_config(config_manager: &ConfigManager, registry: Arc<ProviderRegistry>) -> Result<Self> {
        let request_timeout = config_manager
            .get_duration("dispatcher.request_timeout")
            .unwrap_or(Duration::from_secs(60));

        let transport = ReqwestTransport::new(request_timeout)?;
        let config = DispatcherConfig::from_config(config_manager)?;

        Ok(Self::new(registry, Arc::new(transport), config))
    }

    /// Retry and polling settings in effect
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Provider registry this dispatcher charges calls to
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Generates an image for a prompt
    pub async fn generate(&self, prompt: &str) -> Result<GeneratedImage> {
        let mut job = Job::new(prompt, 0);
        self.run(&mut job).await
    }

    async fn run(&self, job: &mut Job) -> Result<GeneratedImage> {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            job.attempt = attempt;

            match self.attempt(&job.prompt, attempt).await {
                Ok(image) => {
                    debug!(
                        "Job {} generated by {} ({} bytes, attempt {})",
                        job.index,
                        image.provider_id,
                        image.bytes.len(),
                        attempt
                    );
                    return Ok(image);
                }
                Err(error) => {
                    warn!("Job {} attempt {}/{} failed: {}", job.index, attempt, max_attempts, error);

                    let back_off = error.should_back_off() && attempt < max_attempts;
                    last_error = Some(error.to_string());

                    if back_off {
                        let delay = self.config.retry_delay * attempt;
                        debug!("Backing off for {}", format_duration(delay));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::GenerationFailed {
            after_attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(&self, prompt: &str, attempt: u32) -> Result<GeneratedImage> {
        // Released on every early return, so only calls actually made are charged
        let reservation = self.registry.reserve_provider()?;
        let provider_id = reservation.provider_id().to_string();
        let descriptor = reservation.descriptor();

        let credential = match self.registry.next_credential(&provider_id) {
            Ok(credential) => Some(credential),
            Err(error) if descriptor.requires_auth => return Err(error),
            Err(_) => None,
        };

        let model = pick_model(descriptor)?;
        let request = ProviderRequest::build(descriptor, prompt, &model, credential.as_deref())?;

        trace!("Sending {} request to {} ({})", request.shape, provider_id, request.url);

        let result = self.execute(&provider_id, &request).await;

        match &result {
            Ok(_) => reservation.record_success(),
            Err(error) if error.counts_as_provider_call() => reservation.record_failure(),
            Err(_) => reservation.release(),
        }

        result.map(|bytes| GeneratedImage {
            bytes,
            provider_id,
            model,
            attempts: attempt,
        })
    }

    async fn execute(&self, provider_id: &str, request: &ProviderRequest) -> Result<Bytes> {
        let http_request = HttpRequest::post(&request.url, request.body.clone()).with_headers(request.headers.clone());
        let response = self.send(provider_id, http_request).await?;

        if !response.is_success() {
            return Err(status_error(provider_id, &response));
        }

        match request.shape {
            ResponseShape::Binary => response::binary_image(provider_id, &response),
            ResponseShape::JsonEmbedded => response::embedded_image(provider_id, &response),
            ResponseShape::AsyncJob => {
                let poll_url = response::poll_url(provider_id, &response)?;
                self.poll_job(provider_id, &poll_url, request.auth_headers()).await
            }
        }
    }

    async fn poll_job(&self, provider_id: &str, poll_url: &str, headers: Vec<(String, String)>) -> Result<Bytes> {
        let max_polls = self.config.max_poll_attempts;

        for poll in 1..=max_polls {
            tokio::time::sleep(self.config.poll_interval).await;

            let response = match self
                .send(provider_id, HttpRequest::get(poll_url).with_headers(headers.clone()))
                .await
            {
                Ok(response) if response.is_success() => response,
                Ok(response) => {
                    debug!("Poll {} of {} answered {}", poll, provider_id, response.status);
                    continue;
                }
                Err(error) => {
                    debug!("Poll {} of {} failed: {}", poll, provider_id, error);
                    continue;
                }
            };

            let status = response::job_status(provider_id, &response)?;
            trace!("Job on {} is {} after {} polls", provider_id, status.state, poll);

            match status.state {
                AsyncJobState::Succeeded => {
                    let output_url = status.output_url.ok_or_else(|| Error::InvalidResponse {
                        provider: provider_id.to_string(),
                        message: "job succeeded without output".to_string(),
                    })?;

                    return self.fetch_output(provider_id, &output_url).await;
                }
                AsyncJobState::Failed => {
                    return Err(Error::AsyncJobFailed {
                        provider: provider_id.to_string(),
                        reason: status.error.unwrap_or_else(|| "Unknown error".to_string()),
                    });
                }
                AsyncJobState::Queued | AsyncJobState::Processing => {}
            }
        }

        Err(Error::AsyncJobTimeout {
            provider: provider_id.to_string(),
            polls: max_polls,
        })
    }

    async fn fetch_output(&self, provider_id: &str, output_url: &str) -> Result<Bytes> {
        // Output URLs are pre-signed, no credentials
        let response = self.send(provider_id, HttpRequest::get(output_url)).await?;

        if !response.is_success() {
            return Err(status_error(provider_id, &response));
        }

        response::binary_image(provider_id, &response)
    }

    async fn send(&self, provider_id: &str, request: HttpRequest) -> Result<HttpResponse> {
        self.transport
            .send(request)
            .await
            .map_err(|e| Error::ProviderRequestFailed {
                provider: provider_id.to_string(),
                status: None,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl ImageGenerator for Dispatcher {
    async fn generate_job(&self, job: &mut Job) -> Result<GeneratedImage> {
        let result = self.run(job).await;

        if let Err(error) = &result {
            error!("Job {} gave up: {}", job.index, error);
        }

        result
    }
}

fn status_error(provider_id: &str, response: &HttpResponse) -> Error {
    Error::ProviderRequestFailed {
        provider: provider_id.to_string(),
        status: Some(response.status),
        message: response.excerpt(),
    }
}

fn pick_model(descriptor: &ProviderDescriptor) -> Result<String> {
    descriptor
        .models
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| Error::InvalidRequest(format!("Provider {} lists no models", descriptor.id)))
}
