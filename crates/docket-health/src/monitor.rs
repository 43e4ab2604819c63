//! Health monitor: background task that periodically sweeps a worker pool.
//!
//! The monitor owns only the loop. Scoring and restarts happen inside the
//! target's `health_sweep`, under the target's own lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docket_core::WorkerId;

/// Something the monitor can sweep, normally the worker pool.
#[async_trait]
pub trait HealthTarget: Send + Sync + 'static {
    /// Rescore every worker and restart the ones that need it.
    async fn health_sweep(&self) -> SweepReport;
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub checked: usize,
    /// (old id, replacement id) for every restarted worker.
    pub restarted: Vec<(WorkerId, WorkerId)>,
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs `HealthTarget::health_sweep` on a fixed interval.
pub struct HealthMonitor {
    interval: Duration,
    slot: Mutex<Option<MonitorSlot>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slot: Mutex::new(None),
        }
    }

    /// Start the sweep loop. Replaces a loop that is already running.
    pub async fn start(&self, target: Arc<dyn HealthTarget>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            run_health_loop(target, interval, shutdown_rx).await;
        });

        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.replace(MonitorSlot {
            handle,
            shutdown_tx,
        }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
    }

    /// Stop the sweep loop. No-op if it isn't running.
    pub async fn stop(&self) {
        if let Some(slot) = self.slot.lock().await.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!("health monitor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get_mut().take() {
            slot.handle.abort();
        }
    }
}

async fn run_health_loop(
    target: Arc<dyn HealthTarget>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("health loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = target.health_sweep().await;
                if report.restarted.is_empty() {
                    debug!(checked = report.checked, "health sweep complete");
                } else {
                    warn!(
                        checked = report.checked,
                        restarted = report.restarted.len(),
                        "health sweep restarted workers"
                    );
                }
            }
            _ = shutdown.changed() => {
                debug!("health loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl HealthTarget for CountingTarget {
        async fn health_sweep(&self) -> SweepReport {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            SweepReport {
                checked: 2,
                restarted: Vec::new(),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_sweeps_on_interval() {
        let target = Arc::new(CountingTarget::default());
        let monitor = HealthMonitor::new(Duration::from_secs(30));

        monitor.start(target.clone()).await;
        assert!(monitor.is_running().await);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 3);

        monitor.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn monitor_starts_and_stops() {
        let monitor = HealthMonitor::new(Duration::from_secs(30));
        assert!(!monitor.is_running().await);

        monitor.start(Arc::new(CountingTarget::default())).await;
        assert!(monitor.is_running().await);

        monitor.stop().await;
        assert!(!monitor.is_running().await);

        // Stopping twice is harmless.
        monitor.stop().await;
    }

    #[tokio::test]
    async fn monitor_restart_replaces_existing_loop() {
        let monitor = HealthMonitor::new(Duration::from_secs(30));
        monitor.start(Arc::new(CountingTarget::default())).await;
        monitor.start(Arc::new(CountingTarget::default())).await;
        assert!(monitor.is_running().await);
        monitor.stop().await;
    }
}
