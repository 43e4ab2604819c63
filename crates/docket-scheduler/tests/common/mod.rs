//! Shared helpers for pool integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Semaphore, mpsc};

use docket_core::{HealthSettings, PoolConfig, ScalingSettings, Task, TaskId, WorkerType};
use docket_scheduler::{
    ExecutionError, FnExecutor, PoolEvent, TaskExecutor, WorkerContext, WorkerPool, WorkerStatus,
};

/// Single-type pool with the health monitor and periodic autoscaler off,
/// so tests drive both by hand.
pub fn quiet_config(worker_type: WorkerType, min: u32, max: u32) -> PoolConfig {
    PoolConfig {
        health: HealthSettings {
            enabled: false,
            ..HealthSettings::default()
        },
        scaling: ScalingSettings {
            enabled: false,
            ..ScalingSettings::default()
        },
        ..PoolConfig::single_type(worker_type, min, max)
    }
}

/// Executor whose behaviour is read from the task payload:
///
/// - `"gate": true` waits for a permit from `gate`
/// - `"sleep_ms": n` sleeps first
/// - `"hang": true` never returns
/// - `"panic": true` panics
/// - `"fail_until": n` fails the first n attempts
/// - `"fail": true` always fails
pub fn scripted(gate: Arc<Semaphore>) -> Arc<dyn TaskExecutor> {
    let attempts: Arc<Mutex<HashMap<TaskId, u32>>> = Arc::default();
    Arc::new(FnExecutor::new(move |worker: WorkerContext, task: Arc<Task>| {
        let gate = Arc::clone(&gate);
        let attempts = Arc::clone(&attempts);
        async move {
            let attempt = {
                let mut attempts = attempts.lock().unwrap();
                let n = attempts.entry(task.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let data = &task.data;

            if data["gate"] == true {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(e) => return Err(ExecutionError::failed(e.to_string())),
                }
            }
            if let Some(ms) = data["sleep_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if data["hang"] == true {
                std::future::pending::<()>().await;
            }
            if data["panic"] == true {
                panic!("scripted panic");
            }
            if let Some(until) = data["fail_until"].as_u64() {
                if u64::from(attempt) <= until {
                    return Err(ExecutionError::failed(format!("attempt {attempt} failed")));
                }
            }
            if data["fail"] == true {
                return Err(ExecutionError::failed("scripted failure"));
            }
            Ok(json!({ "worker": worker.worker_id.to_string(), "attempt": attempt }))
        }
    }))
}

pub fn task(id: &str, task_type: &str, data: serde_json::Value) -> Task {
    Task::new(task_type, data).with_id(id)
}

pub fn gated(id: &str) -> Task {
    task(id, "ocr_processing", json!({ "gate": true }))
}

pub struct Harness {
    pub pool: WorkerPool,
    pub events: mpsc::UnboundedReceiver<PoolEvent>,
    pub gate: Arc<Semaphore>,
}

impl Harness {
    pub async fn start(config: PoolConfig) -> Self {
        let gate = Arc::new(Semaphore::new(0));
        let pool = WorkerPool::new(config, scripted(Arc::clone(&gate)));
        Self::start_with(pool, gate).await
    }

    pub async fn start_with(pool: WorkerPool, gate: Arc<Semaphore>) -> Self {
        let events = pool.subscribe().await;
        pool.start().await.expect("pool should start");
        Self { pool, events, gate }
    }

    /// Let `n` gated tasks finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Next event matching `pred`, skipping the rest.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&PoolEvent) -> bool) -> PoolEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Every event for `task_id` up to and including its terminal one.
    pub async fn task_history(&mut self, task_id: &str) -> Vec<PoolEvent> {
        let id = TaskId::from(task_id);
        let mut history = Vec::new();
        loop {
            let event = self.wait_for(|e| e.task_id() == Some(&id)).await;
            let done = event.is_terminal();
            history.push(event);
            if done {
                return history;
            }
        }
    }

    /// Drain whatever has already been published.
    pub fn pending_events(&mut self) -> Vec<PoolEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Busy exactly when holding a task, and no task on two workers.
    pub async fn assert_consistent(&self) {
        let workers = self.pool.workers().await;
        let mut seen = Vec::new();
        for worker in &workers {
            assert_eq!(
                worker.status == WorkerStatus::Busy,
                worker.current_task.is_some(),
                "worker {} is {} with task {:?}",
                worker.id,
                worker.status,
                worker.current_task
            );
            if let Some(task_id) = &worker.current_task {
                assert!(!seen.contains(task_id), "task {task_id} on two workers");
                seen.push(task_id.clone());
            }
        }
    }
}
