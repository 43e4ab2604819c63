//! Autoscaler: load-driven worker scaling.
//!
//! Compares a `LoadSnapshot` of the pool against the configured
//! thresholds and emits scaling decisions. The actual scaling is
//! performed by the pool, which owns the autoscaler, calls `evaluate()`
//! under its lock, and reports back with `record_action()` once the pool
//! size has actually changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use docket_core::ScalingSettings;

/// A scaling decision for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified worker count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Instantaneous pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub total_workers: u32,
    pub busy_workers: u32,
    pub queue_length: usize,
}

impl LoadSnapshot {
    /// `max(busy / total, min(1, queued / total))`.
    ///
    /// An empty pool with queued work counts as fully loaded.
    pub fn load(&self) -> f64 {
        if self.total_workers == 0 {
            return if self.queue_length > 0 { 1.0 } else { 0.0 };
        }
        let total = f64::from(self.total_workers);
        let utilisation = f64::from(self.busy_workers) / total;
        let backlog = (self.queue_length as f64 / total).min(1.0);
        utilisation.max(backlog)
    }
}

/// Threshold autoscaler with one cooldown clock shared by both directions.
#[derive(Debug)]
pub struct Autoscaler {
    settings: ScalingSettings,
    min_workers: u32,
    max_workers: u32,
    /// Last time any scaling action was taken.
    last_scale_action: Option<Instant>,
}

impl Autoscaler {
    pub fn new(settings: ScalingSettings, min_workers: u32, max_workers: u32) -> Self {
        Self {
            settings,
            min_workers,
            max_workers,
            last_scale_action: None,
        }
    }

    /// Decide whether to add or remove one worker.
    ///
    /// Does not start the cooldown; see `record_action`.
    pub fn evaluate(&self, snapshot: &LoadSnapshot, now: Instant) -> ScaleDecision {
        let load = snapshot.load();
        let current = snapshot.total_workers;

        if load > self.settings.scale_up_threshold && current < self.max_workers {
            if !self.cooled_down(self.settings.scale_up_cooldown, now) {
                debug!(load, current, "scale-up cooldown active");
                return ScaleDecision::NoChange;
            }
            debug!(
                load,
                threshold = self.settings.scale_up_threshold,
                from = current,
                to = current + 1,
                "scaling up"
            );
            return ScaleDecision::ScaleTo(current + 1);
        }

        if load < self.settings.scale_down_threshold && current > self.min_workers {
            if !self.cooled_down(self.settings.scale_down_cooldown, now) {
                debug!(load, current, "scale-down cooldown active");
                return ScaleDecision::NoChange;
            }
            debug!(
                load,
                threshold = self.settings.scale_down_threshold,
                from = current,
                to = current - 1,
                "scaling down"
            );
            return ScaleDecision::ScaleTo(current - 1);
        }

        ScaleDecision::NoChange
    }

    /// Emergency shrink after a critical resource alert.
    ///
    /// Targets `floor(current * emergency_factor)`, never below the
    /// minimum, and ignores the cooldown.
    pub fn emergency(&self, current: u32) -> ScaleDecision {
        let shrunk = (f64::from(current) * self.settings.emergency_factor).floor() as u32;
        let target = shrunk.max(self.min_workers);
        if target >= current {
            return ScaleDecision::NoChange;
        }
        info!(from = current, to = target, "emergency scale-down");
        ScaleDecision::ScaleTo(target)
    }

    /// Start the shared cooldown. Called once a decision changed the pool.
    pub fn record_action(&mut self, now: Instant) {
        self.last_scale_action = Some(now);
    }

    /// Time of the last scaling action, if any.
    pub fn last_scale_action(&self) -> Option<Instant> {
        self.last_scale_action
    }

    pub fn settings(&self) -> &ScalingSettings {
        &self.settings
    }

    fn cooled_down(&self, cooldown: Duration, now: Instant) -> bool {
        self.last_scale_action
            .is_none_or(|last| now.saturating_duration_since(last) >= cooldown)
    }
}

/// Something the scaler loop can drive, normally the worker pool.
#[async_trait]
pub trait ScaleTarget: Send + Sync + 'static {
    /// Evaluate load and apply the resulting decision.
    async fn autoscale_tick(&self) -> ScaleDecision;
}

/// Run the autoscaler loop until `shutdown` flips.
pub async fn run_autoscale_loop(
    target: Arc<dyn ScaleTarget>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "autoscaler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let ScaleDecision::ScaleTo(target_size) = target.autoscale_tick().await {
                    debug!(target_size, "autoscaler applied decision");
                }
            }
            _ = shutdown.changed() => {
                info!("autoscaler shutting down");
                break;
            }
        }
    }
}
