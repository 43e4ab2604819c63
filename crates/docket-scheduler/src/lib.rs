//! docket-scheduler: worker pool and task scheduling for Docket.
//!
//! The `WorkerPool` owns a set of typed workers and a FIFO task queue.
//! Tasks are routed to idle workers whose type is compatible with the
//! task type; the configured strategy picks among them. Failed attempts
//! are retried with exponential backoff, repeatedly failing or hung
//! workers are replaced, and the pool resizes itself with load.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (Arc<Shared>, one async mutex over PoolState)
//!   ├── workers: WorkerId → Worker + in-flight attempt
//!   ├── TaskQueue (FIFO, retries wait out their backoff in place)
//!   ├── LoadBalancer (round-robin | least-loaded | capability-based)
//!   ├── Autoscaler        ◀── run_autoscale_loop   (docket-autoscale)
//!   ├── HealthMonitor     ──▶ health_check sweeps  (docket-health)
//!   ├── resource alert listener (broadcast::Receiver)
//!   └── EventBus → mpsc subscribers
//!
//! attempt: tokio::spawn(timeout(TaskExecutor::execute)) ──▶ finish under lock
//! ```

pub mod error;
pub mod events;
pub mod executor;
pub mod load_balancer;
pub mod pool;
mod queue;
pub mod stats;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use events::PoolEvent;
pub use executor::{ExecutionError, FnExecutor, TaskExecutor, WorkerContext};
pub use load_balancer::{Candidate, LoadBalancer, RoundRobinBalancer, capability_score};
pub use pool::{Assignment, WorkerPool};
pub use stats::{PoolStatistics, QueueStatus, TaskLocation};
pub use worker::{Worker, WorkerHealth, WorkerInfo, WorkerPerformance, WorkerStatus};

pub use docket_autoscale::ScaleDecision;
pub use docket_health::SweepReport;
