//! Auto-scaler implementation
//!
//! The scaler owns the current worker target and the history of changes to
//! it. Workers only ever read the target; every decision takes a fresh
//! reading from the sampler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use common::error::Result;
use common::models::{ScalingEvent, ScalingReport};
use config::ConfigManager;
use resource_manager::ResourceSampler;

use crate::policy::ScalingPolicy;

/// Number of scaling events retained by default
pub const DEFAULT_SCALING_HISTORY: usize = 50;

struct ScalerState {
    current_workers: usize,
    history: VecDeque<ScalingEvent>,
}

/// Re-evaluates the worker target from live load and backlog
pub struct AutoScaler {
    /// Configured base worker count
    base_workers: usize,

    /// Source of fresh readings
    sampler: Arc<ResourceSampler>,

    /// Decision stages
    policy: ScalingPolicy,

    /// Current target and change log
    state: Mutex<ScalerState>,

    /// Whether decisions are still being made
    enabled: AtomicBool,

    /// Maximum number of events kept
    history_capacity: usize,
}

impl AutoScaler {
    /// Creates a scaler starting at `base_workers`
    pub fn new(base_workers: usize, sampler: Arc<ResourceSampler>, policy: ScalingPolicy) -> Self {
        let base_workers = base_workers.max(1);

        Self {
            base_workers,
            sampler,
            policy,
            state: Mutex::new(ScalerState {
                current_workers: base_workers,
                history: VecDeque::new(),
            }),
            enabled: AtomicBool::new(true),
            history_capacity: DEFAULT_SCALING_HISTORY,
        }
    }

    /// Creates a scaler from the `scaling.*` settings
    pub fn from_config(config_manager: &ConfigManager, sampler: Arc<ResourceSampler>) -> Result<Self> {
        let base_workers = config_manager.get_usize("scaling.base_workers")?;
        let history_capacity = config_manager
            .get_usize("scaling.history_capacity")
            .unwrap_or(DEFAULT_SCALING_HISTORY);
        let enabled = config_manager.get_bool("scaling.enabled").unwrap_or(true);

        let scaler = Self::new(base_workers, sampler, ScalingPolicy::from_config(config_manager))
            .with_history_capacity(history_capacity);
        scaler.enabled.store(enabled, Ordering::SeqCst);

        Ok(scaler)
    }

    /// Sets how many scaling events are retained
    pub fn with_history_capacity(mut self, history_capacity: usize) -> Self {
        self.history_capacity = history_capacity.max(1);
        self
    }

    /// Recomputes the worker target for the given backlog depth
    ///
    /// Records a scaling event when the target changes. When scaling is
    /// disabled the current target is returned unchanged.
    pub async fn adjust_workers(&self, queue_depth: usize) -> usize {
        if !self.scaling_enabled() {
            return self.current_workers();
        }

        let snapshot = self.sampler.sample().await;
        let target = self.policy.evaluate(self.base_workers, &snapshot, queue_depth);

        let mut state = self.state.lock();
        let old_workers = state.current_workers;

        if target != old_workers {
            info!(
                "Scaling workers {} -> {} (cpu {:.1}%, mem {:.1}%, backlog {})",
                old_workers, target, snapshot.cpu_percent, snapshot.mem_percent, queue_depth
            );

            state.history.push_back(ScalingEvent {
                at: Utc::now(),
                old_workers,
                new_workers: target,
                snapshot,
            });
            while state.history.len() > self.history_capacity {
                state.history.pop_front();
            }

            state.current_workers = target;
        } else {
            debug!("Worker target unchanged at {} (backlog {})", target, queue_depth);
        }

        target
    }

    /// Worker target currently in effect
    pub fn current_workers(&self) -> usize {
        self.state.lock().current_workers
    }

    /// Configured base worker count
    pub fn base_workers(&self) -> usize {
        self.base_workers
    }

    /// Returns true while the scaler reacts to load
    pub fn scaling_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The sampler this scaler reads from
    pub fn sampler(&self) -> &Arc<ResourceSampler> {
        &self.sampler
    }

    /// Snapshot of the current target and change history
    pub fn scaling_report(&self) -> ScalingReport {
        let state = self.state.lock();
        let history: Vec<ScalingEvent> = state.history.iter().cloned().collect();

        let average_workers = if history.is_empty() {
            None
        } else {
            let total: usize = history.iter().map(|e| e.new_workers).sum();
            Some(total as f64 / history.len() as f64)
        };

        ScalingReport {
            base_workers: self.base_workers,
            current_workers: state.current_workers,
            scaling_enabled: self.scaling_enabled(),
            total_events: history.len(),
            average_workers,
            last_event: history.last().cloned(),
            history,
        }
    }

    /// Freezes the target and stops the sampler
    pub async fn stop(&self, timeout: Duration) {
        self.enabled.store(false, Ordering::SeqCst);
        self.sampler.stop(timeout).await;

        info!("Auto-scaler stopped at {} workers", self.current_workers());
    }
}
