//! Worker pool: owns the workers, the task queue, and the background loops.
//!
//! All pool state lives behind one async mutex. Task attempts run in
//! spawned tokio tasks outside the lock and re-enter it only to report
//! their outcome, which is discarded if the worker has since been
//! restarted or removed.
//!
//! Background loops (health sweep, autoscaler, resource alerts) hold a
//! weak handle to the pool, so dropping every `WorkerPool` clone lets
//! them wind down on their own. `stop()` is still the orderly way out.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use docket_autoscale::{Autoscaler, LoadSnapshot, ScaleDecision, ScaleTarget, run_autoscale_loop};
use docket_core::{PoolConfig, ResourceAlert, Task, TaskId, WorkerId, WorkerType};
use docket_health::{
    HealthMonitor, HealthTarget, RestartReason, SweepReport, assess, health_score,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, PoolEvent};
use crate::executor::{ExecutionError, TaskExecutor, WorkerContext};
use crate::load_balancer::{Candidate, LoadBalancer};
use crate::queue::TaskQueue;
use crate::stats::{PoolStatistics, QueueStatus, TaskLocation};
use crate::worker::{Worker, WorkerInfo, WorkerStatus};

/// Per-task baseline for queue estimates before any attempt has finished.
const DEFAULT_TASK_ESTIMATE: Duration = Duration::from_secs(1);

/// Outcome of `assign_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Dispatched immediately.
    Assigned(WorkerId),
    /// No compatible worker was idle. `position` is 0-based.
    Queued { position: usize },
}

struct InFlight {
    task: Arc<Task>,
    abort: AbortHandle,
}

struct WorkerSlot {
    worker: Worker,
    in_flight: Option<InFlight>,
}

struct Background {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            handle.abort();
        }
    }
}

struct PoolState {
    running: bool,
    workers: HashMap<WorkerId, WorkerSlot>,
    queue: TaskQueue,
    balancer: LoadBalancer,
    autoscaler: Autoscaler,
    events: EventBus,
    next_sequence: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    background: Option<Background>,
}

impl PoolState {
    fn new(config: &PoolConfig) -> Self {
        Self {
            running: false,
            workers: HashMap::new(),
            queue: TaskQueue::default(),
            balancer: LoadBalancer::new(config.strategy),
            autoscaler: Autoscaler::new(
                config.scaling.clone(),
                config.min_workers,
                config.max_workers,
            ),
            events: EventBus::default(),
            next_sequence: 1,
            tasks_completed: 0,
            tasks_failed: 0,
            background: None,
        }
    }

    /// Worker ids in creation order.
    fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<(u64, WorkerId)> = self
            .workers
            .values()
            .map(|slot| (slot.worker.sequence(), slot.worker.id().clone()))
            .collect();
        ids.sort_unstable_by_key(|(sequence, _)| *sequence);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn running_on(&self, task_id: &TaskId) -> Option<&WorkerId> {
        self.workers
            .iter()
            .find(|(_, slot)| slot.worker.current_task() == Some(task_id))
            .map(|(id, _)| id)
    }

    fn has_idle_worker(&self) -> bool {
        self.workers.values().any(|slot| slot.worker.is_idle())
    }

    fn load_snapshot(&self) -> LoadSnapshot {
        let busy = self
            .workers
            .values()
            .filter(|slot| slot.worker.status() == WorkerStatus::Busy)
            .count();
        LoadSnapshot {
            total_workers: self.workers.len() as u32,
            busy_workers: busy as u32,
            queue_length: self.queue.len(),
        }
    }

    /// Mean attempt duration across the current workers.
    fn mean_processing(&self) -> Option<Duration> {
        let (total, attempts) = self.workers.values().fold(
            (Duration::ZERO, 0u64),
            |(total, attempts), slot| {
                let perf = slot.worker.performance();
                (total + perf.total_processing, attempts + perf.attempts())
            },
        );
        (attempts > 0).then(|| total.div_f64(attempts as f64))
    }

    fn statistics(&self) -> PoolStatistics {
        let mut stats = PoolStatistics {
            running: self.running,
            total_workers: self.workers.len(),
            idle_workers: 0,
            busy_workers: 0,
            error_workers: 0,
            workers_by_type: BTreeMap::new(),
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            average_processing_ms: 0.0,
            average_health: 0.0,
            average_efficiency: 0.0,
            queue_length: self.queue.len(),
            load: self.load_snapshot().load(),
        };

        let mut health = 0.0;
        let mut efficiency = 0.0;
        for slot in self.workers.values() {
            let worker = &slot.worker;
            match worker.status() {
                WorkerStatus::Idle => stats.idle_workers += 1,
                WorkerStatus::Busy => stats.busy_workers += 1,
                WorkerStatus::Error => stats.error_workers += 1,
                WorkerStatus::Initializing | WorkerStatus::Shutdown => {}
            }
            *stats.workers_by_type.entry(worker.worker_type()).or_insert(0) += 1;
            health += worker.health().score;
            efficiency += worker.performance().efficiency;
        }

        if !self.workers.is_empty() {
            let n = self.workers.len() as f64;
            stats.average_health = health / n;
            stats.average_efficiency = efficiency / n;
        }
        if let Some(mean) = self.mean_processing() {
            stats.average_processing_ms = mean.as_secs_f64() * 1000.0;
        }
        stats
    }

    fn queue_status(&self, now: Instant) -> QueueStatus {
        let length = self.queue.len();
        let ready = self.queue.ready_count(now);

        let base = self.mean_processing().unwrap_or(DEFAULT_TASK_ESTIMATE);
        let backlog: Duration = self
            .queue
            .iter()
            .map(|entry| entry.task.estimated_duration(base))
            .sum();
        let workers = self.workers.len().max(1) as u32;

        QueueStatus {
            length,
            ready,
            delayed: length - ready,
            by_type: self.queue.count_by_type(),
            oldest_wait_ms: self.queue.oldest_wait(now).as_millis() as u64,
            estimated_drain_ms: (backlog / workers).as_millis() as u64,
        }
    }
}

struct Shared {
    config: PoolConfig,
    executor: Arc<dyn TaskExecutor>,
    alerts: Option<broadcast::Sender<ResourceAlert>>,
    health_monitor: HealthMonitor,
    state: Mutex<PoolState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(background) = self.state.get_mut().background.take() {
            background.shutdown();
        }
    }
}

/// Aborts the executor call when the attempt is cancelled or times out.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Everything below that takes `state: &mut PoolState` runs under the lock.
impl Shared {
    fn spawn_worker(
        &self,
        state: &mut PoolState,
        worker_type: WorkerType,
        now: Instant,
    ) -> SchedulerResult<WorkerId> {
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let mut worker = Worker::new(worker_type, sequence, now);
        worker.mark_ready()?;
        let worker_id = worker.id().clone();
        state.workers.insert(
            worker_id.clone(),
            WorkerSlot {
                worker,
                in_flight: None,
            },
        );

        debug!(%worker_id, %worker_type, "worker started");
        state.events.publish(PoolEvent::WorkerStarted {
            worker_id: worker_id.clone(),
            worker_type,
        });
        Ok(worker_id)
    }

    /// Remove a worker. An interrupted task goes back to the head of the
    /// queue with its retry count unchanged; callers that want the attempt
    /// charged settle it first with `fail_in_flight`.
    fn retire(&self, state: &mut PoolState, worker_id: &WorkerId, now: Instant) -> Option<WorkerType> {
        let mut slot = state.workers.remove(worker_id)?;
        slot.worker.shutdown();
        if let Some(in_flight) = slot.in_flight.take() {
            in_flight.abort.abort();
            let task = Arc::unwrap_or_clone(in_flight.task);
            debug!(%worker_id, task_id = %task.id, "requeueing interrupted task");
            state.queue.push_front(task, now);
        }
        Some(slot.worker.worker_type())
    }

    fn select_worker(&self, state: &mut PoolState, task_type: &str, priority: u8) -> Option<WorkerId> {
        let types = self.config.compatibility.worker_types_for(task_type)?;
        let key = *types.first()?;

        let mut idle: Vec<(&WorkerId, Candidate)> = state
            .workers
            .iter()
            .filter(|(_, slot)| {
                slot.worker.is_idle() && types.contains(&slot.worker.worker_type())
            })
            .map(|(id, slot)| (id, slot.worker.candidate()))
            .collect();
        idle.sort_unstable_by_key(|(_, candidate)| candidate.sequence);

        let candidates: Vec<Candidate> = idle.iter().map(|(_, c)| *c).collect();
        let index = state.balancer.select(key, &candidates, priority)?;
        Some(idle[index].0.clone())
    }

    fn dispatch(self: &Arc<Self>, state: &mut PoolState, worker_id: &WorkerId, task: Task, now: Instant) {
        let Some(slot) = state.workers.get_mut(worker_id) else {
            state.queue.push_front(task, now);
            return;
        };
        if let Err(err) = slot.worker.assign(task.id.clone(), now) {
            error!(%worker_id, task_id = %task.id, error = %err, "dispatch to unavailable worker");
            state.queue.push_front(task, now);
            return;
        }

        let task = Arc::new(task);
        let task_id = task.id.clone();
        let attempt = task.retry_count + 1;
        let timeout = task.timeout.unwrap_or(self.config.default_task_timeout);
        let handle = tokio::spawn(Arc::clone(self).run_attempt(
            slot.worker.context(),
            Arc::clone(&task),
            timeout,
        ));
        slot.in_flight = Some(InFlight {
            task,
            abort: handle.abort_handle(),
        });

        debug!(%worker_id, %task_id, attempt, "task assigned");
        state.events.publish(PoolEvent::TaskAssigned {
            task_id,
            worker_id: worker_id.clone(),
            attempt,
        });
    }

    /// Hand the first ready compatible queued task to a freshly idle worker.
    fn dispatch_next(self: &Arc<Self>, state: &mut PoolState, worker_id: &WorkerId, now: Instant) {
        let Some(slot) = state.workers.get(worker_id) else {
            return;
        };
        if !slot.worker.is_idle() {
            return;
        }
        let worker_type = slot.worker.worker_type();
        let compatibility = &self.config.compatibility;
        if let Some(task) = state
            .queue
            .take_first(now, |task| compatibility.is_compatible(&task.task_type, worker_type))
        {
            self.dispatch(state, worker_id, task, now);
        }
    }

    /// Dispatch every ready queued task that has an idle compatible worker.
    fn drain_queue(self: &Arc<Self>, state: &mut PoolState, now: Instant) {
        if state.queue.is_empty() {
            return;
        }
        let mut index = 0;
        while let Some(entry) = state.queue.get(index) {
            if !state.has_idle_worker() {
                break;
            }
            if !entry.is_ready(now) {
                index += 1;
                continue;
            }
            let task_type = entry.task.task_type.clone();
            let priority = entry.task.priority;
            match self.select_worker(state, &task_type, priority) {
                Some(worker_id) => {
                    if let Some(entry) = state.queue.remove(index) {
                        self.dispatch(state, &worker_id, entry.task, now);
                    }
                }
                None => index += 1,
            }
        }
    }

    /// Drain the queue once a retry backoff has elapsed.
    fn schedule_drain(self: &Arc<Self>, delay: Duration) {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                let mut state = shared.state.lock().await;
                if state.running {
                    shared.drain_queue(&mut state, Instant::now());
                }
            }
        });
    }

    async fn run_attempt(self: Arc<Self>, worker: WorkerContext, task: Arc<Task>, timeout: Duration) {
        let started = Instant::now();

        let executor = Arc::clone(&self.executor);
        let attempt_worker = worker.clone();
        let attempt_task = Arc::clone(&task);
        let mut attempt =
            tokio::spawn(async move { executor.execute(&attempt_worker, attempt_task).await });
        let _guard = AbortOnDrop(attempt.abort_handle());

        let outcome = match tokio::time::timeout(timeout, &mut attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(ExecutionError::failed("executor panicked"))
            }
            Ok(Err(_)) => Err(ExecutionError::Cancelled("attempt aborted".into())),
            Err(_) => Err(ExecutionError::Timeout(timeout)),
        };

        self.finish(&worker.worker_id, &task.id, outcome, started.elapsed())
            .await;
    }

    async fn finish(
        self: &Arc<Self>,
        worker_id: &WorkerId,
        task_id: &TaskId,
        outcome: Result<serde_json::Value, ExecutionError>,
        elapsed: Duration,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        let Some(slot) = state.workers.get_mut(worker_id) else {
            debug!(%worker_id, %task_id, "discarding outcome from removed worker");
            return;
        };
        if slot.worker.current_task() != Some(task_id) {
            debug!(%worker_id, %task_id, "discarding stale outcome");
            return;
        }
        let Some(in_flight) = slot.in_flight.take() else {
            return;
        };
        let task = Arc::unwrap_or_clone(in_flight.task);

        match outcome {
            Ok(output) => self.complete(state, worker_id, task, output, elapsed, now),
            Err(error) => self.fail(state, worker_id, task, error, elapsed, now),
        }
    }

    fn complete(
        self: &Arc<Self>,
        state: &mut PoolState,
        worker_id: &WorkerId,
        task: Task,
        output: serde_json::Value,
        elapsed: Duration,
        now: Instant,
    ) {
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return;
        };
        if let Err(err) = slot.worker.complete(elapsed) {
            error!(%worker_id, task_id = %task.id, error = %err, "completion on non-busy worker");
            return;
        }
        let score = health_score(&slot.worker.health_sample(), &self.config.health);
        slot.worker.set_health_score(score);

        state.tasks_completed += 1;
        let duration_ms = elapsed.as_millis() as u64;
        debug!(%worker_id, task_id = %task.id, duration_ms, "task completed");
        state.events.publish(PoolEvent::TaskCompleted {
            task_id: task.id,
            worker_id: worker_id.clone(),
            output,
            duration_ms,
        });

        self.dispatch_next(state, worker_id, now);
    }

    fn fail(
        self: &Arc<Self>,
        state: &mut PoolState,
        worker_id: &WorkerId,
        task: Task,
        error: ExecutionError,
        elapsed: Duration,
        now: Instant,
    ) {
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return;
        };
        if let Err(err) = slot.worker.fail(elapsed, error.to_string()) {
            error!(%worker_id, task_id = %task.id, error = %err, "failure on non-busy worker");
            return;
        }
        let score = health_score(&slot.worker.health_sample(), &self.config.health);
        slot.worker.set_health_score(score);
        let failures = slot.worker.health().consecutive_failures;

        self.settle_failure(state, worker_id, task, error, now);

        if failures >= self.config.health.restart_after_failures {
            let reason = format!("{failures} consecutive failures");
            if let Err(err) = self.restart_locked(state, worker_id, &reason, now) {
                error!(%worker_id, error = %err, "restart after failures failed");
            }
        } else if let Some(slot) = state.workers.get_mut(worker_id) {
            if slot.worker.recover().is_ok() {
                self.dispatch_next(state, worker_id, now);
            }
        }
    }

    /// Retry accounting for a failed attempt: requeue with backoff while
    /// retries remain, otherwise report `TaskFailed`.
    fn settle_failure(
        self: &Arc<Self>,
        state: &mut PoolState,
        worker_id: &WorkerId,
        mut task: Task,
        error: ExecutionError,
        now: Instant,
    ) {
        task.retry_count += 1;
        let max_retries = task.max_retries.unwrap_or(self.config.retry.max_retries);
        if error.is_retryable() && task.retry_count <= max_retries {
            let delay = self.config.retry.delay_for(task.retry_count);
            let delay_ms = delay.as_millis() as u64;
            warn!(
                %worker_id,
                task_id = %task.id,
                attempt = task.retry_count,
                delay_ms,
                %error,
                "task failed, retry scheduled"
            );
            state.events.publish(PoolEvent::TaskRetryScheduled {
                task_id: task.id.clone(),
                error,
                attempt: task.retry_count,
                delay_ms,
            });
            state.queue.push_back(task, now, now + delay);
            self.schedule_drain(delay);
        } else {
            warn!(
                %worker_id,
                task_id = %task.id,
                attempts = task.retry_count,
                %error,
                "task failed permanently"
            );
            state.tasks_failed += 1;
            state.events.publish(PoolEvent::TaskFailed {
                task_id: task.id,
                error,
                attempts: task.retry_count,
            });
        }
    }

    /// Abort a hung attempt and charge it as a failure. The worker itself
    /// is left for the caller to restart.
    fn fail_in_flight(
        self: &Arc<Self>,
        state: &mut PoolState,
        worker_id: &WorkerId,
        error: ExecutionError,
        now: Instant,
    ) {
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return;
        };
        let Some(in_flight) = slot.in_flight.take() else {
            return;
        };
        in_flight.abort.abort();
        let task = Arc::unwrap_or_clone(in_flight.task);
        self.settle_failure(state, worker_id, task, error, now);
    }

    fn restart_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        worker_id: &WorkerId,
        reason: &str,
        now: Instant,
    ) -> SchedulerResult<WorkerId> {
        let worker_type = self
            .retire(state, worker_id, now)
            .ok_or_else(|| SchedulerError::WorkerNotFound(worker_id.clone()))?;
        let new_worker_id = self.spawn_worker(state, worker_type, now)?;

        warn!(old = %worker_id, new = %new_worker_id, reason, "worker restarted");
        state.events.publish(PoolEvent::WorkerRestarted {
            old_worker_id: worker_id.clone(),
            new_worker_id: new_worker_id.clone(),
            worker_type,
            reason: reason.to_string(),
        });

        self.drain_queue(state, now);
        Ok(new_worker_id)
    }

    /// Primary worker type with the most queued tasks; the configured
    /// default when the queue is empty.
    fn backlog_worker_type(&self, state: &PoolState) -> WorkerType {
        let mut counts: BTreeMap<WorkerType, usize> = BTreeMap::new();
        for entry in state.queue.iter() {
            if let Some(worker_type) = self
                .config
                .compatibility
                .primary_worker_type(&entry.task.task_type)
            {
                *counts.entry(worker_type).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(worker_type, _)| worker_type)
            .unwrap_or(self.config.default_worker_type)
    }

    /// Grow or shrink toward `target`, clamped to the configured bounds.
    /// Only idle workers are removed. Returns the resulting size.
    fn scale_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        target: u32,
        reason: &str,
        now: Instant,
    ) -> SchedulerResult<u32> {
        let target = target.clamp(self.config.min_workers, self.config.max_workers);
        let current = state.workers.len() as u32;

        if target > current {
            let worker_type = self.backlog_worker_type(state);
            for _ in current..target {
                self.spawn_worker(state, worker_type, now)?;
            }
            self.drain_queue(state, now);
        } else if target < current {
            let mut per_type: HashMap<WorkerType, usize> = HashMap::new();
            for slot in state.workers.values() {
                *per_type.entry(slot.worker.worker_type()).or_insert(0) += 1;
            }

            // Keep the last worker of each type when possible, then the
            // healthiest, then the oldest.
            let mut victims: Vec<(bool, f64, u64, WorkerId)> = state
                .workers
                .values()
                .filter(|slot| slot.worker.is_idle())
                .map(|slot| {
                    let w = &slot.worker;
                    let last_of_type = per_type.get(&w.worker_type()).copied().unwrap_or(0) <= 1;
                    (last_of_type, w.retention_score(), w.sequence(), w.id().clone())
                })
                .collect();
            victims.sort_by(|a, b| {
                a.0.cmp(&b.0)
                    .then(a.1.total_cmp(&b.1))
                    .then(b.2.cmp(&a.2))
            });

            let excess = (current - target) as usize;
            for (_, _, _, worker_id) in victims.into_iter().take(excess) {
                if let Some(worker_type) = self.retire(state, &worker_id, now) {
                    debug!(%worker_id, "worker removed");
                    state.events.publish(PoolEvent::WorkerStopped {
                        worker_id,
                        worker_type,
                    });
                }
            }
        }

        let size = state.workers.len() as u32;
        if size != current {
            info!(from = current, to = size, reason, "pool scaled");
            state.events.publish(PoolEvent::PoolScaled {
                from: current,
                to: size,
                reason: reason.to_string(),
            });
        } else if size != target {
            debug!(current, target, "no idle workers to remove");
        }
        Ok(size)
    }

    fn autoscale_locked(self: &Arc<Self>, state: &mut PoolState, now: Instant) -> ScaleDecision {
        let snapshot = state.load_snapshot();
        let decision = state.autoscaler.evaluate(&snapshot, now);
        self.apply_scale(state, decision, "load", now)
    }

    /// Carry out a scaling decision. The cooldown starts only when the pool
    /// size actually moved; the returned decision carries the size reached.
    fn apply_scale(
        self: &Arc<Self>,
        state: &mut PoolState,
        decision: ScaleDecision,
        reason: &str,
        now: Instant,
    ) -> ScaleDecision {
        let ScaleDecision::ScaleTo(target) = decision else {
            return ScaleDecision::NoChange;
        };
        let current = state.workers.len() as u32;
        match self.scale_locked(state, target, reason, now) {
            Ok(size) if size != current => {
                state.autoscaler.record_action(now);
                ScaleDecision::ScaleTo(size)
            }
            Ok(_) => ScaleDecision::NoChange,
            Err(err) => {
                error!(error = %err, reason, "scaling failed");
                if state.workers.len() as u32 != current {
                    state.autoscaler.record_action(now);
                }
                ScaleDecision::NoChange
            }
        }
    }
}

/// The worker pool. Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self::build(config, executor, None)
    }

    /// A pool that sheds workers when critical alerts arrive on `alerts`.
    pub fn with_resource_alerts(
        config: PoolConfig,
        executor: Arc<dyn TaskExecutor>,
        alerts: broadcast::Sender<ResourceAlert>,
    ) -> Self {
        Self::build(config, executor, Some(alerts))
    }

    fn build(
        config: PoolConfig,
        executor: Arc<dyn TaskExecutor>,
        alerts: Option<broadcast::Sender<ResourceAlert>>,
    ) -> Self {
        let state = PoolState::new(&config);
        Self {
            shared: Arc::new(Shared {
                health_monitor: HealthMonitor::new(config.health.interval),
                config,
                executor,
                alerts,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Validate the config, create the initial workers and start the
    /// background loops. Calling it on a running pool does nothing.
    pub async fn start(&self) -> SchedulerResult<()> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut state = shared.state.lock().await;
        if state.running {
            debug!("worker pool already running");
            return Ok(());
        }
        config.validate()?;

        let now = Instant::now();
        for &worker_type in &config.worker_types {
            shared.spawn_worker(&mut state, worker_type, now)?;
        }
        let mut top_up = config.worker_types.iter().cycle();
        while (state.workers.len() as u32) < config.min_workers {
            let Some(&worker_type) = top_up.next() else {
                break;
            };
            shared.spawn_worker(&mut state, worker_type, now)?;
        }
        state.running = true;

        let handle = PoolHandle(Arc::downgrade(shared));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        if config.scaling.enabled {
            handles.push(tokio::spawn(run_autoscale_loop(
                Arc::new(handle.clone()),
                config.scaling.interval,
                shutdown_rx.clone(),
            )));
        }
        if let Some(alerts) = &shared.alerts {
            handles.push(tokio::spawn(run_alert_listener(
                handle.clone(),
                alerts.subscribe(),
                shutdown_rx,
            )));
        }
        state.background = Some(Background {
            shutdown_tx,
            handles,
        });
        if config.health.enabled {
            shared.health_monitor.start(Arc::new(handle)).await;
        }

        info!(
            workers = state.workers.len(),
            min = config.min_workers,
            max = config.max_workers,
            strategy = ?config.strategy,
            "worker pool started"
        );
        Ok(())
    }

    /// Stop the loops and every worker. In-flight attempts are aborted and
    /// every task still waiting is reported as `TaskFailed` (cancelled).
    /// Calling it on a stopped pool does nothing.
    pub async fn stop(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if !state.running {
            debug!("worker pool already stopped");
            return;
        }
        state.running = false;

        if let Some(background) = state.background.take() {
            background.shutdown();
        }
        shared.health_monitor.stop().await;

        let now = Instant::now();
        for worker_id in state.worker_ids() {
            if let Some(worker_type) = shared.retire(&mut state, &worker_id, now) {
                state.events.publish(PoolEvent::WorkerStopped {
                    worker_id,
                    worker_type,
                });
            }
        }

        let cancelled = state.queue.drain();
        let cancelled_count = cancelled.len();
        for task in cancelled {
            state.tasks_failed += 1;
            state.events.publish(PoolEvent::TaskFailed {
                task_id: task.id,
                error: ExecutionError::Cancelled("worker pool stopped".into()),
                attempts: task.retry_count,
            });
        }

        info!(cancelled = cancelled_count, "worker pool stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.running
    }

    /// Submit a task. Dispatches to an idle compatible worker if there is
    /// one, otherwise queues it (and lets the autoscaler react).
    pub async fn assign_task(&self, task: Task) -> SchedulerResult<Assignment> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if !state.running {
            return Err(SchedulerError::NotRunning);
        }
        if shared
            .config
            .compatibility
            .worker_types_for(&task.task_type)
            .is_none()
        {
            warn!(task_type = %task.task_type, "no worker type handles task type");
            return Err(SchedulerError::Configuration(format!(
                "no worker type handles task type '{}'",
                task.task_type
            )));
        }
        if state.queue.position(&task.id).is_some() || state.running_on(&task.id).is_some() {
            return Err(SchedulerError::DuplicateTask(task.id));
        }

        let now = Instant::now();
        if let Some(worker_id) = shared.select_worker(&mut state, &task.task_type, task.priority) {
            shared.dispatch(&mut state, &worker_id, task, now);
            return Ok(Assignment::Assigned(worker_id));
        }

        let task_id = task.id.clone();
        let task_type = task.task_type.clone();
        let position = state.queue.push_back(task, now, now);
        debug!(%task_id, %task_type, position, "task queued");
        state.events.publish(PoolEvent::TaskQueued {
            task_id: task_id.clone(),
            task_type,
            position,
        });

        if !shared.config.scaling.enabled {
            return Ok(Assignment::Queued { position });
        }
        // A scale-up drains the queue, which may already have placed the task.
        shared.autoscale_locked(&mut state, now);
        if let Some(worker_id) = state.running_on(&task_id) {
            return Ok(Assignment::Assigned(worker_id.clone()));
        }
        let position = state.queue.position(&task_id).unwrap_or(position);
        Ok(Assignment::Queued { position })
    }

    /// Resize the pool, clamped to `[min_workers, max_workers]`. Busy
    /// workers are never removed, so a shrink can fall short of `target`.
    /// Returns the new size.
    pub async fn scale_pool(&self, target: u32) -> SchedulerResult<u32> {
        let mut state = self.shared.state.lock().await;
        if !state.running {
            return Err(SchedulerError::NotRunning);
        }
        self.shared
            .scale_locked(&mut state, target, "manual", Instant::now())
    }

    /// Replace a worker with a fresh one of the same type. Returns the new id.
    pub async fn restart_worker(&self, worker_id: &WorkerId) -> SchedulerResult<WorkerId> {
        let mut state = self.shared.state.lock().await;
        self.shared
            .restart_locked(&mut state, worker_id, "manual restart", Instant::now())
    }

    /// Rescore every worker and restart the ones that need it.
    pub async fn health_check(&self) -> SweepReport {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let now = Instant::now();

        let mut flagged = Vec::new();
        for worker_id in state.worker_ids() {
            if let Some(slot) = state.workers.get_mut(&worker_id) {
                let assessment = assess(&slot.worker.health_sample(), &shared.config.health, now);
                slot.worker.set_health_score(assessment.score);
                if let Some(reason) = assessment.restart {
                    flagged.push((worker_id, reason));
                }
            }
        }

        let mut report = SweepReport {
            checked: state.workers.len(),
            restarted: Vec::new(),
        };
        for (worker_id, reason) in flagged {
            // A hung attempt counts against the task's retries, so a task
            // that outlives the staleness threshold still terminates.
            if let RestartReason::Stale(age) = reason {
                shared.fail_in_flight(&mut state, &worker_id, ExecutionError::Timeout(age), now);
            }
            match shared.restart_locked(&mut state, &worker_id, &reason.to_string(), now) {
                Ok(new_worker_id) => report.restarted.push((worker_id, new_worker_id)),
                Err(err) => warn!(%worker_id, error = %err, "health restart failed"),
            }
        }
        report
    }

    /// Evaluate load once and apply the decision. Runs even when the
    /// periodic autoscaler is disabled.
    pub async fn autoscale_check(&self) -> ScaleDecision {
        let mut state = self.shared.state.lock().await;
        if !state.running {
            return ScaleDecision::NoChange;
        }
        self.shared.autoscale_locked(&mut state, Instant::now())
    }

    /// React to an external resource alert. Critical and emergency alerts
    /// shrink the pool immediately, bypassing the cooldown.
    pub async fn handle_resource_alert(&self, alert: &ResourceAlert) -> ScaleDecision {
        if !alert.severity.requires_shedding() {
            debug!(severity = ?alert.severity, resource = %alert.resource, "resource alert ignored");
            return ScaleDecision::NoChange;
        }

        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if !state.running {
            return ScaleDecision::NoChange;
        }
        warn!(
            severity = ?alert.severity,
            resource = %alert.resource,
            message = %alert.message,
            "resource pressure, shedding workers"
        );

        let current = state.workers.len() as u32;
        let decision = state.autoscaler.emergency(current);
        let reason = format!("resource alert: {}", alert.resource);
        shared.apply_scale(&mut state, decision, &reason, Instant::now())
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.shared.state.lock().await.events.subscribe()
    }

    pub async fn pool_statistics(&self) -> PoolStatistics {
        self.shared.state.lock().await.statistics()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.shared.state.lock().await.queue_status(Instant::now())
    }

    pub async fn task_location(&self, task_id: &TaskId) -> SchedulerResult<TaskLocation> {
        let state = self.shared.state.lock().await;
        if let Some(position) = state.queue.position(task_id) {
            return Ok(TaskLocation::Queued { position });
        }
        if let Some(worker_id) = state.running_on(task_id) {
            return Ok(TaskLocation::Running {
                worker_id: worker_id.clone(),
            });
        }
        Err(SchedulerError::TaskNotFound(task_id.clone()))
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> SchedulerResult<WorkerInfo> {
        let state = self.shared.state.lock().await;
        state
            .workers
            .get(worker_id)
            .map(|slot| slot.worker.info(Instant::now()))
            .ok_or_else(|| SchedulerError::WorkerNotFound(worker_id.clone()))
    }

    /// Every worker, in creation order.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.shared.state.lock().await;
        let now = Instant::now();
        state
            .worker_ids()
            .iter()
            .filter_map(|id| state.workers.get(id))
            .map(|slot| slot.worker.info(now))
            .collect()
    }

    pub async fn workers_by_type(&self, worker_type: WorkerType) -> Vec<WorkerInfo> {
        self.workers()
            .await
            .into_iter()
            .filter(|info| info.worker_type == worker_type)
            .collect()
    }
}

/// Weak handle the background loops drive the pool through.
#[derive(Clone)]
struct PoolHandle(Weak<Shared>);

impl PoolHandle {
    fn upgrade(&self) -> Option<WorkerPool> {
        self.0.upgrade().map(|shared| WorkerPool { shared })
    }
}

#[async_trait]
impl HealthTarget for PoolHandle {
    async fn health_sweep(&self) -> SweepReport {
        match self.upgrade() {
            Some(pool) => pool.health_check().await,
            None => SweepReport::default(),
        }
    }
}

#[async_trait]
impl ScaleTarget for PoolHandle {
    async fn autoscale_tick(&self) -> ScaleDecision {
        match self.upgrade() {
            Some(pool) => pool.autoscale_check().await,
            None => ScaleDecision::NoChange,
        }
    }
}

async fn run_alert_listener(
    pool: PoolHandle,
    mut alerts: broadcast::Receiver<ResourceAlert>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = alerts.recv() => match received {
                Ok(alert) => {
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    pool.handle_resource_alert(&alert).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "resource alerts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("resource alert channel closed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}
