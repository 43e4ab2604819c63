//! Health scoring for a single worker.
//!
//! The score starts from a 0.5 baseline and adds weighted factors:
//!
//! ```text
//! score = 0.5
//!       + 0.4 * efficiency
//!       + 0.3 * (1 - min(avg_processing / latency_reference, 1))
//!       - min(0.1 * consecutive_failures, 0.5)
//! ```
//!
//! clamped to `[0.1, 1.0]`.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use docket_core::HealthSettings;

const BASELINE: f64 = 0.5;
const PERFORMANCE_WEIGHT: f64 = 0.4;
const RESPONSIVENESS_WEIGHT: f64 = 0.3;
const PENALTY_PER_FAILURE: f64 = 0.1;
const MAX_FAILURE_PENALTY: f64 = 0.5;

pub const MIN_SCORE: f64 = 0.1;
pub const MAX_SCORE: f64 = 1.0;

/// Inputs the scorer reads from a worker.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    /// completed / (completed + failed), 1.0 before the first attempt.
    pub efficiency: f64,
    pub average_processing: Duration,
    pub consecutive_failures: u32,
    pub busy: bool,
    pub last_heartbeat: Instant,
}

/// Why a worker should be restarted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartReason {
    /// Busy with no heartbeat for this long.
    Stale(Duration),
    ConsecutiveFailures(u32),
    LowScore(f64),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Stale(age) => write!(f, "no heartbeat for {}s", age.as_secs()),
            RestartReason::ConsecutiveFailures(n) => write!(f, "{n} consecutive failures"),
            RestartReason::LowScore(score) => write!(f, "health score {score:.2}"),
        }
    }
}

/// Outcome of assessing one worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthAssessment {
    pub score: f64,
    pub restart: Option<RestartReason>,
}

impl HealthAssessment {
    pub fn needs_restart(&self) -> bool {
        self.restart.is_some()
    }
}

/// Compute the health score for a sample.
pub fn health_score(sample: &HealthSample, settings: &HealthSettings) -> f64 {
    let efficiency = sample.efficiency.clamp(0.0, 1.0);

    let reference = settings.latency_reference.as_secs_f64();
    let latency_ratio = if reference > 0.0 {
        (sample.average_processing.as_secs_f64() / reference).min(1.0)
    } else {
        1.0
    };

    let penalty =
        (PENALTY_PER_FAILURE * f64::from(sample.consecutive_failures)).min(MAX_FAILURE_PENALTY);

    let score = BASELINE + PERFORMANCE_WEIGHT * efficiency
        + RESPONSIVENESS_WEIGHT * (1.0 - latency_ratio)
        - penalty;
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Score a worker and decide whether it must be restarted.
///
/// Restart triggers, in order: a busy worker whose heartbeat is older than
/// the staleness threshold, a failure streak at the restart threshold, and
/// a non-busy worker scoring below `unhealthy_score`.
pub fn assess(sample: &HealthSample, settings: &HealthSettings, now: Instant) -> HealthAssessment {
    let score = health_score(sample, settings);

    let age = now.saturating_duration_since(sample.last_heartbeat);
    let restart = if sample.busy && age > settings.staleness_threshold {
        Some(RestartReason::Stale(age))
    } else if sample.consecutive_failures >= settings.restart_after_failures {
        Some(RestartReason::ConsecutiveFailures(sample.consecutive_failures))
    } else if !sample.busy && score < settings.unhealthy_score {
        Some(RestartReason::LowScore(score))
    } else {
        None
    };

    HealthAssessment { score, restart }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: Instant) -> HealthSample {
        HealthSample {
            efficiency: 1.0,
            average_processing: Duration::ZERO,
            consecutive_failures: 0,
            busy: false,
            last_heartbeat: now,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn fresh_worker_scores_maximum() {
        let now = Instant::now();
        let score = health_score(&sample(now), &HealthSettings::default());
        assert!(approx(score, MAX_SCORE));
    }

    #[test]
    fn slow_worker_loses_responsiveness() {
        let now = Instant::now();
        let settings = HealthSettings::default();
        let mut s = sample(now);
        s.efficiency = 0.5;

        // 0.5 + 0.2 + 0.3 = 1.0
        assert!(approx(health_score(&s, &settings), 1.0));

        // Half the reference latency: 0.5 + 0.2 + 0.15
        s.average_processing = Duration::from_millis(500);
        assert!(approx(health_score(&s, &settings), 0.85));

        // Beyond the reference it bottoms out at zero contribution.
        s.average_processing = Duration::from_secs(10);
        assert!(approx(health_score(&s, &settings), 0.7));
    }

    #[test]
    fn failures_penalize_linearly_up_to_cap() {
        let now = Instant::now();
        let settings = HealthSettings::default();
        let mut s = sample(now);
        s.efficiency = 0.0;
        s.average_processing = Duration::from_secs(5);

        s.consecutive_failures = 2;
        assert!(approx(health_score(&s, &settings), 0.3));

        s.consecutive_failures = 4;
        assert!(approx(health_score(&s, &settings), MIN_SCORE));

        s.consecutive_failures = 50;
        assert!(approx(health_score(&s, &settings), MIN_SCORE));
    }

    #[test]
    fn score_is_clamped() {
        let now = Instant::now();
        let mut s = sample(now);
        s.efficiency = 7.0;
        let score = health_score(&s, &HealthSettings::default());
        assert!((MIN_SCORE..=MAX_SCORE).contains(&score));
    }

    #[test]
    fn healthy_worker_needs_nothing() {
        let now = Instant::now();
        let a = assess(&sample(now), &HealthSettings::default(), now);
        assert!(!a.needs_restart());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_worker_without_heartbeat_is_stale() {
        let settings = HealthSettings::default();
        let mut s = sample(Instant::now());
        s.busy = true;

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(!assess(&s, &settings, Instant::now()).needs_restart());

        tokio::time::advance(Duration::from_secs(2)).await;
        let a = assess(&s, &settings, Instant::now());
        assert!(matches!(a.restart, Some(RestartReason::Stale(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_is_never_stale() {
        let settings = HealthSettings::default();
        let s = sample(Instant::now());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!assess(&s, &settings, Instant::now()).needs_restart());
    }

    #[test]
    fn failure_streak_triggers_restart() {
        let now = Instant::now();
        let mut s = sample(now);
        s.consecutive_failures = 3;
        let a = assess(&s, &HealthSettings::default(), now);
        assert_eq!(a.restart, Some(RestartReason::ConsecutiveFailures(3)));
    }

    #[test]
    fn low_score_restarts_only_when_not_busy() {
        let now = Instant::now();
        let settings = HealthSettings {
            unhealthy_score: 0.5,
            ..HealthSettings::default()
        };
        let mut s = sample(now);
        s.efficiency = 0.0;
        s.average_processing = Duration::from_secs(5);
        s.consecutive_failures = 1;

        let a = assess(&s, &settings, now);
        assert!(matches!(a.restart, Some(RestartReason::LowScore(_))));

        s.busy = true;
        assert!(!assess(&s, &settings, now).needs_restart());
    }

    #[test]
    fn restart_reason_display() {
        assert_eq!(
            RestartReason::Stale(Duration::from_secs(130)).to_string(),
            "no heartbeat for 130s"
        );
        assert_eq!(
            RestartReason::ConsecutiveFailures(3).to_string(),
            "3 consecutive failures"
        );
    }
}
