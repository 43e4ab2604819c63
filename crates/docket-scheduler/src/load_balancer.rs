//! Worker selection strategies.
//!
//! The pool hands the balancer the idle workers compatible with a task,
//! sorted by creation order, and gets back an index into that slice.
//! Selection runs under the pool lock, so the balancer itself is plain
//! mutable state.

use std::collections::HashMap;

use docket_core::{LoadBalancingStrategy, MAX_PRIORITY, WorkerType};

const HEALTH_WEIGHT: f64 = 0.4;
const EFFICIENCY_WEIGHT: f64 = 0.3;
const LOAD_WEIGHT: f64 = 0.2;
const PRIORITY_WEIGHT: f64 = 0.1;
/// Completed-task count at which the load factor bottoms out.
const LOAD_SCALE: f64 = 100.0;

/// What the balancer sees of an idle worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub sequence: u64,
    pub worker_type: WorkerType,
    pub tasks_completed: u64,
    pub efficiency: f64,
    pub health_score: f64,
}

/// `0.4·health + 0.3·efficiency + 0.2·(1 − completed/100) + 0.1·(priority/5)`,
/// clamped to `[0, 1]`.
pub fn capability_score(candidate: &Candidate, priority: u8) -> f64 {
    // Goes negative past 100 tasks; only the total is clamped.
    let load = 1.0 - candidate.tasks_completed as f64 / LOAD_SCALE;
    let priority = f64::from(priority.min(MAX_PRIORITY)) / f64::from(MAX_PRIORITY);
    let score = HEALTH_WEIGHT * candidate.health_score
        + EFFICIENCY_WEIGHT * candidate.efficiency
        + LOAD_WEIGHT * load
        + PRIORITY_WEIGHT * priority;
    score.clamp(0.0, 1.0)
}

/// Rotates through candidates, one cursor per task family.
///
/// The cursor remembers the sequence number of the last pick rather than
/// an index, so the rotation survives workers joining and leaving.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    last: HashMap<WorkerType, u64>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the first candidate after the previous pick for `key`, wrapping
    /// around. Returns `None` if there are no candidates.
    pub fn next(&mut self, key: WorkerType, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.last.get(&key) {
            Some(&last) => candidates
                .iter()
                .position(|c| c.sequence > last)
                .unwrap_or(0),
            None => 0,
        };
        self.last.insert(key, candidates[index].sequence);
        Some(index)
    }

    pub fn reset(&mut self) {
        self.last.clear();
    }

    /// Sequence number of the last pick for `key` (for diagnostics).
    pub fn last_selected(&self, key: WorkerType) -> Option<u64> {
        self.last.get(&key).copied()
    }
}

/// Applies the configured strategy.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin: RoundRobinBalancer,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin: RoundRobinBalancer::new(),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Choose among `candidates` (sorted by sequence) for a task whose
    /// primary worker type is `key`. Ties go to the earliest candidate.
    pub fn select(&mut self, key: WorkerType, candidates: &[Candidate], priority: u8) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin.next(key, candidates),
            LoadBalancingStrategy::LeastLoaded => {
                let mut best = 0;
                for (i, c) in candidates.iter().enumerate().skip(1) {
                    if c.tasks_completed < candidates[best].tasks_completed {
                        best = i;
                    }
                }
                Some(best)
            }
            LoadBalancingStrategy::CapabilityBased => {
                let mut best = 0;
                let mut best_score = capability_score(&candidates[0], priority);
                for (i, c) in candidates.iter().enumerate().skip(1) {
                    let score = capability_score(c, priority);
                    if score > best_score {
                        best = i;
                        best_score = score;
                    }
                }
                Some(best)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(sequence: u64, completed: u64, health: f64) -> Candidate {
        Candidate {
            sequence,
            worker_type: WorkerType::DocumentProcessor,
            tasks_completed: completed,
            efficiency: 1.0,
            health_score: health,
        }
    }

    const KEY: WorkerType = WorkerType::DocumentProcessor;

    #[test]
    fn round_robin_cycles_through_candidates() {
        let mut lb = RoundRobinBalancer::new();
        let pool = [candidate(1, 0, 1.0), candidate(2, 0, 1.0), candidate(3, 0, 1.0)];

        assert_eq!(lb.next(KEY, &pool), Some(0));
        assert_eq!(lb.next(KEY, &pool), Some(1));
        assert_eq!(lb.next(KEY, &pool), Some(2));
        assert_eq!(lb.next(KEY, &pool), Some(0)); // wraps
        assert_eq!(lb.last_selected(KEY), Some(1));
    }

    #[test]
    fn round_robin_empty_returns_none() {
        let mut lb = RoundRobinBalancer::new();
        assert_eq!(lb.next(KEY, &[]), None);
    }

    #[test]
    fn round_robin_follows_sequence_not_index() {
        let mut lb = RoundRobinBalancer::new();
        let pool = [candidate(1, 0, 1.0), candidate(2, 0, 1.0), candidate(3, 0, 1.0)];
        assert_eq!(lb.next(KEY, &pool), Some(0));

        // Worker 2 is busy; the next idle after 1 is 3.
        let idle = [candidate(1, 0, 1.0), candidate(3, 0, 1.0)];
        assert_eq!(lb.next(KEY, &idle), Some(1));

        // Worker 4 joins; rotation continues after 3.
        let grown = [candidate(1, 0, 1.0), candidate(2, 0, 1.0), candidate(4, 0, 1.0)];
        assert_eq!(lb.next(KEY, &grown), Some(2));
    }

    #[test]
    fn round_robin_keys_are_independent() {
        let mut lb = RoundRobinBalancer::new();
        let pool = [candidate(1, 0, 1.0), candidate(2, 0, 1.0)];
        assert_eq!(lb.next(KEY, &pool), Some(0));
        assert_eq!(lb.next(WorkerType::LegalAnalyzer, &pool), Some(0));
        assert_eq!(lb.next(KEY, &pool), Some(1));

        lb.reset();
        assert_eq!(lb.last_selected(KEY), None);
    }

    #[test]
    fn least_loaded_prefers_fewest_completed() {
        let mut lb = LoadBalancer::new(LoadBalancingStrategy::LeastLoaded);
        let pool = [candidate(1, 5, 1.0), candidate(2, 2, 1.0), candidate(3, 2, 1.0)];
        assert_eq!(lb.select(KEY, &pool, 3), Some(1));
    }

    #[test]
    fn capability_prefers_healthier_worker() {
        let mut lb = LoadBalancer::new(LoadBalancingStrategy::CapabilityBased);
        let pool = [candidate(1, 0, 0.5), candidate(2, 0, 0.9)];
        assert_eq!(lb.select(KEY, &pool, 3), Some(1));
    }

    #[test]
    fn capability_tie_goes_to_first() {
        let mut lb = LoadBalancer::new(LoadBalancingStrategy::CapabilityBased);
        let pool = [candidate(1, 0, 1.0), candidate(2, 0, 1.0)];
        assert_eq!(lb.select(KEY, &pool, 5), Some(0));
    }

    #[test]
    fn capability_score_formula() {
        let fresh = candidate(1, 0, 1.0);
        assert!((capability_score(&fresh, 5) - 1.0).abs() < 1e-9);
        assert!((capability_score(&fresh, 1) - 0.92).abs() < 1e-9);

        let worn = Candidate {
            efficiency: 0.5,
            ..candidate(2, 200, 0.5)
        };
        // 0.2 + 0.15 - 0.2 + 0.06
        assert!((capability_score(&worn, 3) - 0.21).abs() < 1e-9);
    }

    #[test]
    fn heavily_used_workers_still_rank_by_load() {
        let busier = candidate(1, 300, 1.0);
        let lighter = candidate(2, 150, 1.0);
        assert!(capability_score(&lighter, 3) > capability_score(&busier, 3));

        let mut balancer = LoadBalancer::new(LoadBalancingStrategy::CapabilityBased);
        assert_eq!(balancer.select(KEY, &[busier, lighter], 3), Some(1));
    }

    #[test]
    fn select_on_empty_is_none() {
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::LeastLoaded,
            LoadBalancingStrategy::CapabilityBased,
        ] {
            assert_eq!(LoadBalancer::new(strategy).select(KEY, &[], 3), None);
        }
    }
}
