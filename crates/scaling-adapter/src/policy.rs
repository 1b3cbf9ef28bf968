//! Worker count policy
//!
//! Three pure stages, evaluated fresh for every decision:
//! resource fit, then backlog fit, then the overload guard.

use common::models::ResourceSnapshot;
use config::ConfigManager;
use resource_manager::ResourceThresholds;

/// Backlog above which the target is doubled
pub const DEEP_BACKLOG: usize = 100;

/// Backlog below which the target is halved
pub const SHALLOW_BACKLOG: usize = 10;

/// Converts resource readings and backlog depth into a worker count
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScalingPolicy {
    thresholds: ResourceThresholds,
}

impl ScalingPolicy {
    /// Creates a policy with the given overload thresholds
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self { thresholds }
    }

    /// Creates a policy with thresholds read from configuration
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        Self::new(ResourceThresholds::from_config(config_manager))
    }

    /// Overload thresholds in effect
    pub fn thresholds(&self) -> ResourceThresholds {
        self.thresholds
    }

    /// Worker count the free CPU and memory can carry, in `[1, base × 2]`
    pub fn optimal_workers(base: usize, snapshot: &ResourceSnapshot) -> usize {
        let base = base.max(1);

        let cpu_room = 100.0 - clamp_percent(snapshot.cpu_percent);
        let mem_room = 100.0 - clamp_percent(snapshot.mem_percent);

        let cpu_scale = scale(base, cpu_room);
        let mem_scale = scale(base, mem_room);

        cpu_scale
            .min(mem_scale)
            .min(base.saturating_mul(2))
            .max(1)
    }

    /// Doubles the target on a deep backlog, halves it on a shallow one
    pub fn adjust_for_backlog(optimal: usize, queue_depth: usize, base: usize) -> usize {
        let ceiling = base.max(1).saturating_mul(4);

        let adjusted = if queue_depth > DEEP_BACKLOG {
            optimal.saturating_mul(2).min(ceiling)
        } else if queue_depth < SHALLOW_BACKLOG {
            (optimal / 2).max(1)
        } else {
            optimal
        };

        adjusted.clamp(1, ceiling)
    }

    /// Returns true if CPU or memory is above its threshold
    pub fn overloaded(&self, snapshot: &ResourceSnapshot) -> bool {
        self.thresholds.exceeded_by(snapshot)
    }

    /// Runs all three stages and returns the worker target
    pub fn evaluate(&self, base: usize, snapshot: &ResourceSnapshot, queue_depth: usize) -> usize {
        let optimal = Self::optimal_workers(base, snapshot);
        let target = Self::adjust_for_backlog(optimal, queue_depth, base);

        if self.overloaded(snapshot) {
            (target / 2).max(1)
        } else {
            target
        }
    }
}

fn scale(base: usize, room_percent: f64) -> usize {
    ((base as f64 * room_percent / 100.0).floor() as usize).max(1)
}

// Unreadable percentages count as full load
fn clamp_percent(value: f32) -> f64 {
    if value.is_nan() {
        100.0
    } else {
        f64::from(value).clamp(0.0, 100.0)
    }
}
