//! docket-health: worker health scoring and self-healing for Docket.
//!
//! Scores each worker from its efficiency, average processing latency,
//! and failure streak, and flags workers that need a restart. The
//! monitor runs a background task that periodically sweeps the pool.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   └── background task (every `health.interval`)
//!       └── HealthTarget::health_sweep()   (implemented by the pool)
//!           ├── assess(sample) → score, restart reason
//!           └── restart flagged workers
//! ```
//!
//! # Restart triggers
//!
//! - a busy worker whose last heartbeat is older than `staleness_threshold`
//!   (presumed hung)
//! - `restart_after_failures` consecutive failures
//! - an idle worker whose score fell below `unhealthy_score`

pub mod monitor;
pub mod score;

pub use monitor::{HealthMonitor, HealthTarget, SweepReport};
pub use score::{HealthAssessment, HealthSample, RestartReason, assess, health_score};
