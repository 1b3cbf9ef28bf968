//! Common data models for Mass Dispatch
//!
//! This module defines the data models shared between the sampler, the
//! scaler, the provider registry, the dispatcher and the worker pool.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One CPU/memory reading taken by the resource sampler
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Global CPU utilisation (percentage)
    pub cpu_percent: f32,
    /// Memory utilisation (percentage)
    pub mem_percent: f32,
    /// When the reading was taken
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Creates a snapshot stamped with the current time
    pub fn now(cpu_percent: f32, mem_percent: f32) -> Self {
        Self {
            cpu_percent,
            mem_percent,
            taken_at: Utc::now(),
        }
    }

    /// Zero-load snapshot used before the first successful probe
    pub fn idle() -> Self {
        Self::now(0.0, 0.0)
    }
}

/// A change in worker count decided by the auto-scaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    /// Decision time
    pub at: DateTime<Utc>,
    /// Worker count before the decision
    pub old_workers: usize,
    /// Worker count after the decision
    pub new_workers: usize,
    /// Reading the decision was based on
    pub snapshot: ResourceSnapshot,
}

/// Scaling report handed to collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingReport {
    /// Configured base worker count
    pub base_workers: usize,
    /// Worker count currently in effect
    pub current_workers: usize,
    /// Whether the scaler still reacts to load
    pub scaling_enabled: bool,
    /// Number of retained scaling events
    pub total_events: usize,
    /// Mean of `new_workers` over the retained events
    pub average_workers: Option<f64>,
    /// Retained scaling events, oldest first
    pub history: Vec<ScalingEvent>,
    /// Most recent scaling event
    pub last_event: Option<ScalingEvent>,
}

/// Static description of a generation provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderDescriptor {
    /// Unique provider identifier (also names the credential file)
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Endpoint base URL
    pub base_url: String,
    /// Request/response variant with its typed generation parameters
    pub kind: ProviderKind,
    /// Maximum calls per calendar day
    pub daily_quota: u32,
    /// Whether a credential must accompany each request
    #[serde(default = "default_true")]
    pub requires_auth: bool,
    /// Disabled providers are never selected
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Models supported by the provider, one is picked at random per request
    pub models: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Provider variants with distinct request and response shapes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    /// Hugging Face inference API, returns raw image bytes
    Huggingface(HuggingfaceOptions),
    /// Replicate predictions API, returns an asynchronous job
    Replicate(ReplicateOptions),
    /// Stability AI generation API, returns base64 artifacts in JSON
    StabilityAi(StabilityOptions),
}

impl ProviderKind {
    /// Short variant name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Huggingface(_) => "huggingface",
            ProviderKind::Replicate(_) => "replicate",
            ProviderKind::StabilityAi(_) => "stability_ai",
        }
    }
}

/// Hugging Face text-to-image parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HuggingfaceOptions {
    /// Negative prompt
    pub negative_prompt: String,
    /// Denoising steps
    pub num_inference_steps: u32,
    /// Classifier-free guidance scale
    pub guidance_scale: f32,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl Default for HuggingfaceOptions {
    fn default() -> Self {
        Self {
            negative_prompt: "blurry, low quality, bad anatomy".to_string(),
            num_inference_steps: 25,
            guidance_scale: 7.5,
            width: 512,
            height: 512,
        }
    }
}

/// Replicate prediction parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicateOptions {
    /// Model version hash to run
    pub version: String,
    /// Negative prompt
    pub negative_prompt: String,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Number of images per prediction
    pub num_outputs: u32,
    /// Denoising steps
    pub num_inference_steps: u32,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            version: "db21e45d3f7023abc2a46ee38a23973f6dce16bb082a930b0c49861f96d1e5bf".to_string(),
            negative_prompt: "blurry".to_string(),
            width: 512,
            height: 512,
            num_outputs: 1,
            num_inference_steps: 25,
        }
    }
}

/// Stability AI text-to-image parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StabilityOptions {
    /// Prompt adherence
    pub cfg_scale: f32,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Number of images
    pub samples: u32,
    /// Denoising steps
    pub steps: u32,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            cfg_scale: 7.0,
            width: 512,
            height: 512,
            samples: 1,
            steps: 30,
        }
    }
}

/// Mutable per-provider call accounting
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderUsage {
    /// Calls made, successful or not
    pub total_calls: u64,
    /// Calls that produced an image
    pub success_calls: u64,
    /// Calls that failed
    pub fail_calls: u64,
    /// Calls per calendar day; only today's entry is valid
    pub daily_calls: BTreeMap<NaiveDate, u32>,
    /// Time of the most recent call
    pub last_used_at: Option<DateTime<Utc>>,
    /// Round-robin cursor into the credential pool
    pub next_key_index: usize,
    /// Calls reserved by selection and not yet charged
    #[serde(default)]
    pub in_flight: u32,
}

impl ProviderUsage {
    /// Creates usage with a zeroed entry for `today`
    pub fn new(today: NaiveDate) -> Self {
        let mut daily_calls = BTreeMap::new();
        daily_calls.insert(today, 0);

        Self {
            daily_calls,
            ..Default::default()
        }
    }

    /// Calls charged against today's quota
    pub fn calls_on(&self, day: NaiveDate) -> u32 {
        self.daily_calls.get(&day).copied().unwrap_or(0)
    }

    /// Returns true if any entry belongs to a day other than `today`
    pub fn is_stale(&self, today: NaiveDate) -> bool {
        self.daily_calls.keys().any(|day| *day != today)
    }

    /// Resets the daily counters to `{today: 0}` when they hold another date
    pub fn rebase(&mut self, today: NaiveDate) -> bool {
        if !self.is_stale(today) {
            return false;
        }

        self.daily_calls.clear();
        self.daily_calls.insert(today, 0);
        true
    }

    /// Calls charged or reserved against today's quota
    pub fn committed_on(&self, day: NaiveDate) -> u32 {
        self.calls_on(day).saturating_add(self.in_flight)
    }

    /// Charges one call made at `now` on `today`
    pub fn record_call(&mut self, today: NaiveDate, now: DateTime<Utc>, success: bool) {
        self.rebase(today);

        self.total_calls += 1;
        *self.daily_calls.entry(today).or_insert(0) += 1;

        if success {
            self.success_calls += 1;
        } else {
            self.fail_calls += 1;
        }

        self.last_used_at = Some(now);
    }

    /// Success percentage over all calls (0 when no calls were made)
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.success_calls as f64 / self.total_calls as f64 * 100.0
        }
    }
}

/// Cumulative usage summary for one provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Calls made since start
    pub total_calls: u64,
    /// Percentage of calls that produced an image
    pub success_rate: f64,
    /// Calls charged against today's quota
    pub today_calls: u32,
}

/// A unit of generation work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Prompt text
    pub prompt: String,
    /// Caller-assigned index
    pub index: usize,
    /// Attempts consumed so far
    pub attempt: u32,
}

impl Job {
    /// Creates a fresh job
    pub fn new(prompt: impl Into<String>, index: usize) -> Self {
        Self {
            prompt: prompt.into(),
            index,
            attempt: 0,
        }
    }
}

/// Image bytes together with where they came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// Raw response bytes as returned by the provider
    pub bytes: Bytes,
    /// Provider that produced the image
    pub provider_id: String,
    /// Model used for the request
    pub model: String,
    /// Attempt number that succeeded (1-based)
    pub attempts: u32,
}

/// Terminal result of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Index of the job this outcome belongs to
    pub index: usize,
    /// Whether an image was produced
    pub success: bool,
    /// Generated image on success
    pub value: Option<GeneratedImage>,
    /// Error description on failure
    pub error: Option<String>,
}

impl JobOutcome {
    /// Successful outcome
    pub fn succeeded(index: usize, image: GeneratedImage) -> Self {
        Self {
            index,
            success: true,
            value: Some(image),
            error: None,
        }
    }

    /// Failed outcome
    pub fn failed(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[test]
    fn test_record_call_counts_today() {
        let mut usage = ProviderUsage::new(day(18));
        usage.record_call(day(18), Utc::now(), true);
        usage.record_call(day(18), Utc::now(), false);

        assert_eq!(usage.total_calls, 2);
        assert_eq!(usage.success_calls, 1);
        assert_eq!(usage.fail_calls, 1);
        assert_eq!(usage.calls_on(day(18)), 2);
        assert!(usage.last_used_at.is_some());
        assert_eq!(usage.success_rate(), 50.0);
    }

    #[test]
    fn test_rebase_after_rollover() {
        let mut usage = ProviderUsage::new(day(17));
        usage.record_call(day(17), Utc::now(), true);

        assert!(!usage.rebase(day(17)));
        assert!(usage.rebase(day(18)));
        assert_eq!(usage.daily_calls.len(), 1);
        assert_eq!(usage.calls_on(day(18)), 0);
        // Lifetime counters survive the rollover
        assert_eq!(usage.total_calls, 1);
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "id": "stability",
            "base_url": "https://api.stability.ai/v1/generation",
            "kind": {"type": "stability_ai", "cfg_scale": 7.0, "width": 512, "height": 512, "samples": 1, "steps": 30},
            "daily_quota": 25,
            "models": ["stable-diffusion-xl-1024-v1-0"]
        }"#;

        let descriptor: ProviderDescriptor = serde_json::from_str(json).unwrap();
        assert!(descriptor.enabled);
        assert!(descriptor.requires_auth);
        assert_eq!(descriptor.kind.name(), "stability_ai");
    }
}
