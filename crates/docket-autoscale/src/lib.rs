//! docket-autoscale: load-driven worker scaling.
//!
//! Computes the pool's instantaneous load from busy workers and queue
//! depth, compares it against the configured thresholds, and emits
//! one-step scaling decisions.
//!
//! # Scaling Algorithm
//!
//! ```text
//! load = max(busy / total, min(1, queued / total))
//!
//! if load > scale_up_threshold and total < max and up cooldown elapsed:
//!     ScaleTo(total + 1)
//!
//! if load < scale_down_threshold and total > min and down cooldown elapsed:
//!     ScaleTo(total - 1)
//!
//! on critical resource alert:
//!     ScaleTo(max(min, floor(total * emergency_factor)))   // no cooldown
//! ```
//!
//! Both cooldowns are measured from a single "last scale action"
//! timestamp, so a scale-up also delays the next scale-down.

pub mod scaler;

pub use scaler::{Autoscaler, LoadSnapshot, ScaleDecision, ScaleTarget, run_autoscale_loop};
