//! Resource sampling implementation
//!
//! This module measures CPU and memory utilisation, either on demand or on a
//! background tick that keeps a bounded history of readings.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use common::error::Result;
use common::models::ResourceSnapshot;
use config::ConfigManager;

/// Number of readings retained by default
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Shortest background sampling period
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Source of raw CPU/memory readings
///
/// Returns `(cpu_percent, mem_percent)`, or `None` when the counters are
/// unavailable.
pub trait ResourceProbe: Send + 'static {
    fn probe(&mut self) -> Option<(f32, f32)>;
}

/// Probe backed by the operating system counters
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    /// Creates a probe and primes the CPU counters
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn probe(&mut self) -> Option<(f32, f32)> {
        // CPU usage is measured since the previous refresh
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        if total_memory == 0 {
            return None;
        }

        let cpu_percent = self.system.global_cpu_info().cpu_usage();
        if !cpu_percent.is_finite() {
            return None;
        }

        let mem_percent = (self.system.used_memory() as f32 / total_memory as f32) * 100.0;

        Some((cpu_percent, mem_percent))
    }
}

/// Probe whose readings are set by hand
///
/// Clones share the same reading, so a test or an external collector can
/// keep one handle and give the other to the sampler.
#[derive(Clone, Default)]
pub struct ManualProbe {
    reading: Arc<Mutex<Option<(f32, f32)>>>,
}

impl ManualProbe {
    /// Creates a probe reporting the given load
    pub fn new(cpu_percent: f32, mem_percent: f32) -> Self {
        let probe = Self::default();
        probe.set(cpu_percent, mem_percent);
        probe
    }

    /// Changes the reported load
    pub fn set(&self, cpu_percent: f32, mem_percent: f32) {
        *self.reading.lock() = Some((cpu_percent, mem_percent));
    }

    /// Makes the probe report unavailable counters
    pub fn fail(&self) {
        *self.reading.lock() = None;
    }
}

impl ResourceProbe for ManualProbe {
    fn probe(&mut self) -> Option<(f32, f32)> {
        *self.reading.lock()
    }
}

/// Load thresholds above which the system counts as overloaded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    /// CPU usage threshold (percentage)
    pub cpu_usage_percent: f32,

    /// Memory usage threshold (percentage)
    pub memory_usage_percent: f32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 80.0,
            memory_usage_percent: 80.0,
        }
    }
}

impl ResourceThresholds {
    /// Reads `scaling.cpu_threshold_percent` and `scaling.memory_threshold_percent`
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();

        Self {
            cpu_usage_percent: config_manager
                .get_f32("scaling.cpu_threshold_percent")
                .unwrap_or(defaults.cpu_usage_percent),
            memory_usage_percent: config_manager
                .get_f32("scaling.memory_threshold_percent")
                .unwrap_or(defaults.memory_usage_percent),
        }
    }

    /// Returns true if either reading is strictly above its threshold
    ///
    /// An unreadable (NaN) reading counts as full load.
    pub fn exceeded_by(&self, snapshot: &ResourceSnapshot) -> bool {
        above(snapshot.cpu_percent, self.cpu_usage_percent) || above(snapshot.mem_percent, self.memory_usage_percent)
    }
}

fn above(reading: f32, threshold: f32) -> bool {
    reading.is_nan() || reading > threshold
}

struct SamplingTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic CPU/memory sampler with a bounded history
pub struct ResourceSampler {
    /// Reading source, only ever used from the blocking pool
    probe: Arc<Mutex<Box<dyn ResourceProbe>>>,

    /// Recent readings, oldest first
    history: Arc<RwLock<VecDeque<ResourceSnapshot>>>,

    /// Most recent successful reading
    last_known: Arc<RwLock<ResourceSnapshot>>,

    /// Maximum number of readings kept
    history_capacity: usize,

    /// Background loop, present while running
    task: Mutex<Option<SamplingTask>>,
}

impl ResourceSampler {
    /// Creates a sampler around the given probe
    pub fn new(probe: impl ResourceProbe, history_capacity: usize) -> Self {
        Self {
            probe: Arc::new(Mutex::new(Box::new(probe))),
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_capacity))),
            last_known: Arc::new(RwLock::new(ResourceSnapshot::idle())),
            history_capacity: history_capacity.max(1),
            task: Mutex::new(None),
        }
    }

    /// Creates a sampler reading the OS counters, sized from `sampler.history_capacity`
    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let history_capacity = config_manager
            .get_usize("sampler.history_capacity")
            .unwrap_or(DEFAULT_HISTORY_CAPACITY);

        Ok(Self::new(SysinfoProbe::new(), history_capacity))
    }

    /// Starts the background sampling loop
    ///
    /// Returns false if the loop was already running. Intervals shorter than
    /// [`MIN_SAMPLE_INTERVAL`] are raised to it.
    pub fn start(&self, interval: Duration) -> bool {
        let mut task = self.task.lock();

        if task.as_ref().map_or(false, |t| !t.handle.is_finished()) {
            return false;
        }

        let interval = if interval < MIN_SAMPLE_INTERVAL {
            warn!("Sampling interval {:?} is too short, using {:?}", interval, MIN_SAMPLE_INTERVAL);
            MIN_SAMPLE_INTERVAL
        } else {
            interval
        };

        let token = CancellationToken::new();
        let probe = self.probe.clone();
        let history = self.history.clone();
        let last_known = self.last_known.clone();
        let capacity = self.history_capacity;
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = Self::read_probe(&probe, &last_known).await;
                        trace!("Sampled cpu {:.1}% mem {:.1}%", snapshot.cpu_percent, snapshot.mem_percent);

                        let mut history = history.write();
                        history.push_back(snapshot);
                        while history.len() > capacity {
                            history.pop_front();
                        }
                    }
                }
            }

            debug!("Resource sampling loop exited");
        });

        *task = Some(SamplingTask { token, handle });

        info!("Resource sampler started with interval {:?}", interval);

        true
    }

    /// Stops the background loop and waits up to `timeout` for it to exit
    ///
    /// Returns false if the loop had to be abandoned.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let Some(task) = self.task.lock().take() else {
            return true;
        };

        task.token.cancel();

        match tokio::time::timeout(timeout, task.handle).await {
            Ok(_) => {
                info!("Resource sampler stopped");
                true
            }
            Err(_) => {
                warn!("Resource sampler did not stop within {:?}", timeout);
                false
            }
        }
    }

    /// Returns true while the background loop is active
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |t| !t.handle.is_finished())
    }

    /// Takes an immediate, uncached reading
    pub async fn sample(&self) -> ResourceSnapshot {
        Self::read_probe(&self.probe, &self.last_known).await
    }

    /// Most recent reading from the background loop
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history.read().back().copied()
    }

    /// Retained readings, oldest first
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history.read().iter().copied().collect()
    }

    /// Maximum number of readings retained
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    async fn read_probe(
        probe: &Arc<Mutex<Box<dyn ResourceProbe>>>,
        last_known: &Arc<RwLock<ResourceSnapshot>>,
    ) -> ResourceSnapshot {
        let probe = probe.clone();
        let reading = tokio::task::spawn_blocking(move || probe.lock().probe())
            .await
            .ok()
            .flatten();

        match reading {
            Some((cpu_percent, mem_percent)) => {
                let snapshot = ResourceSnapshot::now(cpu_percent, mem_percent);
                *last_known.write() = snapshot;
                snapshot
            }
            None => {
                // Degrade to the last good values
                let previous = *last_known.read();
                ResourceSnapshot::now(previous.cpu_percent, previous.mem_percent)
            }
        }
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_is_uncached() {
        let probe = ManualProbe::new(10.0, 20.0);
        let sampler = ResourceSampler::new(probe.clone(), 10);

        let first = sampler.sample().await;
        probe.set(55.0, 65.0);
        let second = sampler.sample().await;

        assert_eq!((first.cpu_percent, first.mem_percent), (10.0, 20.0));
        assert_eq!((second.cpu_percent, second.mem_percent), (55.0, 65.0));
        // On-demand samples never enter the history
        assert!(sampler.history().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_last_known() {
        let probe = ManualProbe::new(42.0, 17.0);
        let sampler = ResourceSampler::new(probe.clone(), 10);

        sampler.sample().await;
        probe.fail();
        let degraded = sampler.sample().await;

        assert_eq!((degraded.cpu_percent, degraded.mem_percent), (42.0, 17.0));
    }

    #[tokio::test]
    async fn test_failure_before_first_reading_is_idle() {
        let probe = ManualProbe::default();
        let sampler = ResourceSampler::new(probe, 10);

        let snapshot = sampler.sample().await;
        assert_eq!((snapshot.cpu_percent, snapshot.mem_percent), (0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let sampler = ResourceSampler::new(ManualProbe::new(30.0, 30.0), 5);

        assert!(sampler.start(Duration::from_millis(100)));
        assert!(!sampler.start(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(sampler.history().len(), 5);
        assert!(sampler.latest().is_some());
        assert!(sampler.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sampling() {
        let sampler = ResourceSampler::new(ManualProbe::new(30.0, 30.0), 100);
        sampler.start(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(sampler.is_running());
        assert!(sampler.stop(Duration::from_secs(1)).await);
        assert!(!sampler.is_running());

        let frozen = sampler.history().len();
        assert!(frozen >= 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sampler.history().len(), frozen);

        // Stopping twice is harmless
        assert!(sampler.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised() {
        let sampler = ResourceSampler::new(ManualProbe::new(30.0, 30.0), 100);
        assert!(sampler.start(Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sampler.is_running());
        assert!(!sampler.history().is_empty());
        assert!(sampler.stop(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_thresholds() {
        let thresholds = ResourceThresholds::default();

        assert!(!thresholds.exceeded_by(&ResourceSnapshot::now(80.0, 80.0)));
        assert!(thresholds.exceeded_by(&ResourceSnapshot::now(80.5, 10.0)));
        assert!(thresholds.exceeded_by(&ResourceSnapshot::now(10.0, 95.0)));
        assert!(thresholds.exceeded_by(&ResourceSnapshot::now(f32::NAN, 10.0)));
        assert!(thresholds.exceeded_by(&ResourceSnapshot::now(10.0, f32::NAN)));
    }
}
