//! Mass Dispatch composition root
//!
//! Wires the resource sampler, auto-scaler, provider registry, dispatcher and
//! worker pool together from one `ConfigManager` and runs prompt batches
//! through them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use common::models::{Job, ProviderUsage, ScalingReport, UsageReport};
use config::ConfigManager;
use inference_engine::{Dispatcher, ImageGenerator};
use provider_manager::{ProviderRegistry, SystemClock};
use resource_manager::ResourceSampler;
use scaling_adapter::AutoScaler;
use task_scheduler::{BatchResults, JobHandle, PoolStats, WorkerPool};

/// Sampling interval used when `sampler.interval` is unset
pub const DEFAULT_SAMPLER_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one prompt batch
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs still running when the wait timed out
    pub unresolved: Vec<usize>,
    /// Images produced per provider
    pub images_by_provider: BTreeMap<String, usize>,
    /// Error text of each failed job, keyed by job index
    pub failures: BTreeMap<usize, String>,
    pub usage: BTreeMap<String, UsageReport>,
    pub scaling: ScalingReport,
    pub pool: PoolStats,
}

/// Adaptive image generation orchestrator
pub struct GenerationOrchestrator {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Host load sampler shared with the scaler
    sampler: Arc<ResourceSampler>,

    /// Provider catalog and usage ledgers
    registry: Arc<ProviderRegistry>,

    /// Worker pool running the jobs
    pool: WorkerPool,

    /// Background sampling interval
    sampler_interval: Duration,
}

impl GenerationOrchestrator {
    /// Builds every component from configuration, using the host's sysinfo
    /// probe, the system clock and a `reqwest` transport
    pub fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        let sampler = ResourceSampler::from_config(&config_manager).context("Failed to create resource sampler")?;

        let registry = ProviderRegistry::from_config(&config_manager, Arc::new(SystemClock))
            .context("Failed to load provider catalog")?;
        let registry = Arc::new(registry);

        let dispatcher =
            Dispatcher::from_config(&config_manager, registry.clone()).context("Failed to create dispatcher")?;

        Self::with_components(config_manager, Arc::new(sampler), registry, Arc::new(dispatcher))
    }

    /// Builds the orchestrator around existing components
    ///
    /// `generator` is expected to charge its calls to `registry`.
    pub fn with_components(
        config_manager: Arc<ConfigManager>,
        sampler: Arc<ResourceSampler>,
        registry: Arc<ProviderRegistry>,
        generator: Arc<dyn ImageGenerator>,
    ) -> Result<Self> {
        let scaler = AutoScaler::from_config(&config_manager, sampler.clone())
            .context("Failed to create auto-scaler")?;
        let pool = WorkerPool::from_config(&config_manager, generator, Arc::new(scaler));

        let sampler_interval = config_manager
            .get_duration("sampler.interval")
            .unwrap_or(DEFAULT_SAMPLER_INTERVAL);
        if sampler_interval.is_zero() {
            bail!("sampler.interval must be greater than zero");
        }

        Ok(Self {
            config_manager,
            sampler,
            registry,
            pool,
            sampler_interval,
        })
    }

    /// Starts background sampling and opens the pool at its base size
    pub fn start(&self) -> Result<()> {
        if self.sampler.start(self.sampler_interval) {
            info!("Resource sampling every {:?}", self.sampler_interval);
        }

        let base_workers = self.pool.scaler().base_workers();
        self.pool
            .resize(base_workers)
            .context("Worker pool is already shut down")?;

        info!(
            "Generation orchestrator started with {} providers and {} base workers",
            self.registry.len(),
            base_workers
        );

        Ok(())
    }

    /// Submits one job per prompt, indexed from zero
    pub async fn submit_prompts<I, S>(&self, prompts: I) -> Result<Vec<JobHandle>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let jobs = prompts
            .into_iter()
            .enumerate()
            .map(|(index, prompt)| Job::new(prompt, index));

        self.pool.submit_batch(jobs).await.context("Failed to submit prompts")
    }

    /// Waits for submitted jobs to resolve
    pub async fn await_all(&self, timeout: Duration) -> BatchResults {
        self.pool.await_all(timeout).await
    }

    /// Runs a batch of prompts to completion (or `timeout`) and summarizes it
    pub async fn run_prompts<I, S>(&self, prompts: I, timeout: Duration) -> Result<RunSummary>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handles = self.submit_prompts(prompts).await?;
        info!("Running {} prompts", handles.len());

        let results = self.await_all(timeout).await;
        Ok(self.summarize(&results))
    }

    /// Summarizes a batch against the current usage, scaling and pool state
    pub fn summarize(&self, results: &BatchResults) -> RunSummary {
        let mut images_by_provider = BTreeMap::new();
        let mut failures = BTreeMap::new();

        for outcome in &results.outcomes {
            match (&outcome.value, &outcome.error) {
                (Some(image), _) => *images_by_provider.entry(image.provider_id.clone()).or_insert(0) += 1,
                (None, Some(error)) => {
                    failures.insert(outcome.index, error.clone());
                }
                (None, None) => {}
            }
        }

        let mut unresolved = results.unresolved.clone();
        unresolved.sort_unstable();

        RunSummary {
            succeeded: results.succeeded(),
            failed: results.failed(),
            unresolved,
            images_by_provider,
            failures,
            usage: self.usage_report(),
            scaling: self.scaling_report(),
            pool: self.pool_stats(),
        }
    }

    /// Per-provider usage summary
    pub fn usage_report(&self) -> BTreeMap<String, UsageReport> {
        self.registry.usage_report()
    }

    /// Full per-provider usage ledgers
    pub fn usage_snapshot(&self) -> BTreeMap<String, ProviderUsage> {
        self.registry.usage_snapshot()
    }

    pub fn scaling_report(&self) -> ScalingReport {
        self.pool.scaler().scaling_report()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    /// Drains the pool and stops sampling
    ///
    /// Returns true if every job finished within the configured grace period.
    pub async fn shutdown(&self) -> bool {
        info!("Shutting down generation orchestrator");
        self.pool.shutdown_default().await
    }
}

/// Repeats `prompts` in order until `count` are collected
///
/// With no count the prompts are returned as given. An empty prompt list
/// stays empty.
pub fn expand_prompts(prompts: Vec<String>, count: Option<usize>) -> Vec<String> {
    match count {
        Some(count) if !prompts.is_empty() => prompts.iter().cycle().take(count).cloned().collect(),
        Some(_) => Vec::new(),
        None => prompts,
    }
}

/// Reads one prompt per line, skipping blank lines and `#` comments
pub fn parse_prompts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use common::models::{HuggingfaceOptions, ProviderDescriptor, ProviderKind};
    use inference_engine::{DispatcherConfig, HttpRequest, HttpResponse, HttpTransport, TransportError};
    use resource_manager::ManualProbe;
    use task_scheduler::PoolState;

    /// Fails every fifth request with a server error
    struct StubTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for StubTransport {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 5 == 0 {
                Ok(HttpResponse::new(503, "busy"))
            } else {
                Ok(HttpResponse::new(200, "PNG"))
            }
        }
    }

    fn provider(id: &str, quota: u32) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            base_url: format!("https://{}.test/models", id),
            kind: ProviderKind::Huggingface(HuggingfaceOptions::default()),
            daily_quota: quota,
            requires_auth: false,
            enabled: true,
            models: vec!["sd".to_string()],
        }
    }

    fn orchestrator(descriptors: Vec<ProviderDescriptor>, max_retries: u32) -> GenerationOrchestrator {
        let config_manager = Arc::new(ConfigManager::with_defaults());
        config_manager.set("scaling.base_workers", 3);
        config_manager.set("pool.shutdown_grace", "5s");

        let sampler = Arc::new(ResourceSampler::new(ManualProbe::new(20.0, 30.0), 16));
        let registry = Arc::new(ProviderRegistry::with_system_clock(descriptors, HashMap::new()).unwrap());

        let config = DispatcherConfig {
            max_retries,
            retry_delay: Duration::from_millis(1),
            ..DispatcherConfig::default()
        };
        let transport = Arc::new(StubTransport {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), transport, config));

        GenerationOrchestrator::with_components(config_manager, sampler, registry, dispatcher).unwrap()
    }

    #[tokio::test]
    async fn test_run_prompts_summary() {
        let orchestrator = orchestrator(vec![provider("alpha", 1000), provider("beta", 1000)], 3);
        orchestrator.start().unwrap();

        let prompts = expand_prompts(vec!["a fox".to_string(), "a hen".to_string()], Some(40));
        let summary = orchestrator
            .run_prompts(prompts, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 40);
        assert_eq!(summary.failed, 0);
        assert!(summary.unresolved.is_empty());
        assert_eq!(summary.images_by_provider.values().sum::<usize>(), 40);
        assert_eq!(summary.pool.submitted, 40);
        assert_eq!(summary.pool.pending, 0);

        // Every fifth call failed and was retried; the last call succeeded
        let total_calls: u64 = summary.usage.values().map(|u| u.total_calls).sum();
        assert_eq!(total_calls, 49);
        assert_eq!(orchestrator.scaling_report().base_workers, 3);

        assert!(orchestrator.shutdown().await);
        assert_eq!(orchestrator.pool_stats().state, PoolState::ShutDown);
        assert!(orchestrator.submit_prompts(["late"]).await.is_err());
    }

    #[tokio::test]
    async fn test_exhausted_quota_fails_jobs() {
        let orchestrator = orchestrator(vec![provider("tiny", 4)], 1);
        orchestrator.start().unwrap();

        let summary = orchestrator
            .run_prompts(vec!["cat"; 10], Duration::from_secs(30))
            .await
            .unwrap();

        // Only four calls fit in the quota
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 6);
        assert_eq!(summary.failures.len(), 6);
        assert_eq!(summary.usage["tiny"].today_calls, 4);
        assert_eq!(orchestrator.usage_snapshot()["tiny"].success_calls, 4);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_sampler_interval_is_rejected() {
        let config_manager = Arc::new(ConfigManager::with_defaults());
        config_manager.set("sampler.interval", "0s");

        let sampler = Arc::new(ResourceSampler::new(ManualProbe::new(20.0, 30.0), 16));
        let registry = Arc::new(ProviderRegistry::with_system_clock(vec![provider("alpha", 10)], HashMap::new()).unwrap());
        let transport = Arc::new(StubTransport {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), transport, DispatcherConfig::default()));

        let result = GenerationOrchestrator::with_components(config_manager, sampler.clone(), registry, dispatcher);

        assert!(result.is_err());
        assert!(!sampler.is_running());
    }

    #[test]
    fn test_expand_prompts() {
        let prompts = vec!["a".to_string(), "b".to_string()];

        assert_eq!(expand_prompts(prompts.clone(), Some(5)), ["a", "b", "a", "b", "a"]);
        assert_eq!(expand_prompts(prompts.clone(), Some(1)), ["a"]);
        assert_eq!(expand_prompts(prompts.clone(), None), ["a", "b"]);
        assert!(expand_prompts(Vec::new(), Some(3)).is_empty());
    }

    #[test]
    fn test_parse_prompts() {
        let content = "a lighthouse\n\n  # skipped\n  a red fox  \n";
        assert_eq!(parse_prompts(content), ["a lighthouse", "a red fox"]);
    }
}
