//! docket.toml configuration parser.
//!
//! The file layer (`DocketConfig`) mirrors the TOML with every field
//! optional and durations as strings. `into_pool_config` overlays it onto
//! the defaults and validates the result into a `PoolConfig`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, parse_duration};
use crate::error::ConfigError;
use crate::types::{CompatibilityTable, WorkerType};

// ── File layer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocketConfig {
    pub pool: Option<PoolSection>,
    pub health: Option<HealthSection>,
    pub scaling: Option<ScalingSection>,
    pub retry: Option<RetrySection>,
    pub compatibility: Option<BTreeMap<String, Vec<String>>>,
    pub executor: Option<ExecutorSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSection {
    pub min_workers: Option<u32>,
    pub max_workers: Option<u32>,
    pub worker_types: Option<Vec<String>>,
    pub default_worker_type: Option<String>,
    pub strategy: Option<LoadBalancingStrategy>,
    pub default_task_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSection {
    pub enabled: Option<bool>,
    pub interval: Option<String>,
    pub staleness_threshold: Option<String>,
    pub latency_reference: Option<String>,
    pub restart_after_failures: Option<u32>,
    pub unhealthy_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingSection {
    pub enabled: Option<bool>,
    pub interval: Option<String>,
    pub scale_up_threshold: Option<f64>,
    pub scale_down_threshold: Option<f64>,
    pub scale_up_cooldown: Option<String>,
    pub scale_down_cooldown: Option<String>,
    pub emergency_factor: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub base_delay: Option<String>,
    pub backoff_multiplier: Option<f64>,
    pub max_delay: Option<String>,
}

/// Commands used by the daemon's executor, keyed by task type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
}

impl DocketConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Executor commands declared in `[executor.commands]`.
    pub fn executor_commands(&self) -> BTreeMap<String, Vec<String>> {
        self.executor
            .as_ref()
            .map(|e| e.commands.clone())
            .unwrap_or_default()
    }

    /// Overlay this file onto `PoolConfig::default()` and validate.
    pub fn into_pool_config(&self) -> Result<PoolConfig, ConfigError> {
        let mut config = PoolConfig::default();

        if let Some(pool) = &self.pool {
            if let Some(min) = pool.min_workers {
                config.min_workers = min;
            }
            if let Some(max) = pool.max_workers {
                config.max_workers = max;
            }
            if let Some(types) = &pool.worker_types {
                config.worker_types = types
                    .iter()
                    .map(|t| t.parse::<WorkerType>())
                    .collect::<Result<Vec<_>, _>>()?;
            }
            if let Some(default_type) = &pool.default_worker_type {
                config.default_worker_type = default_type.parse()?;
            }
            if let Some(strategy) = pool.strategy {
                config.strategy = strategy;
            }
            overlay_duration(
                &mut config.default_task_timeout,
                "pool.default_task_timeout",
                &pool.default_task_timeout,
            )?;
        }

        if let Some(health) = &self.health {
            let h = &mut config.health;
            if let Some(enabled) = health.enabled {
                h.enabled = enabled;
            }
            overlay_duration(&mut h.interval, "health.interval", &health.interval)?;
            overlay_duration(
                &mut h.staleness_threshold,
                "health.staleness_threshold",
                &health.staleness_threshold,
            )?;
            overlay_duration(
                &mut h.latency_reference,
                "health.latency_reference",
                &health.latency_reference,
            )?;
            if let Some(n) = health.restart_after_failures {
                h.restart_after_failures = n;
            }
            if let Some(score) = health.unhealthy_score {
                h.unhealthy_score = score;
            }
        }

        if let Some(scaling) = &self.scaling {
            let s = &mut config.scaling;
            if let Some(enabled) = scaling.enabled {
                s.enabled = enabled;
            }
            overlay_duration(&mut s.interval, "scaling.interval", &scaling.interval)?;
            if let Some(t) = scaling.scale_up_threshold {
                s.scale_up_threshold = t;
            }
            if let Some(t) = scaling.scale_down_threshold {
                s.scale_down_threshold = t;
            }
            overlay_duration(
                &mut s.scale_up_cooldown,
                "scaling.scale_up_cooldown",
                &scaling.scale_up_cooldown,
            )?;
            overlay_duration(
                &mut s.scale_down_cooldown,
                "scaling.scale_down_cooldown",
                &scaling.scale_down_cooldown,
            )?;
            if let Some(f) = scaling.emergency_factor {
                s.emergency_factor = f;
            }
        }

        if let Some(retry) = &self.retry {
            let r = &mut config.retry;
            if let Some(n) = retry.max_retries {
                r.max_retries = n;
            }
            overlay_duration(&mut r.base_delay, "retry.base_delay", &retry.base_delay)?;
            if let Some(m) = retry.backoff_multiplier {
                r.backoff_multiplier = m;
            }
            overlay_duration(&mut r.max_delay, "retry.max_delay", &retry.max_delay)?;
        }

        if let Some(entries) = &self.compatibility {
            for (task_type, worker_types) in entries {
                let types = worker_types
                    .iter()
                    .map(|t| t.parse::<WorkerType>())
                    .collect::<Result<Vec<_>, _>>()?;
                if types.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "compatibility entry '{task_type}' lists no worker types"
                    )));
                }
                config.compatibility.insert(task_type.clone(), types);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Render a resolved `PoolConfig` back into file form.
    ///
    /// Compatibility entries are written out in full, defaults included.
    pub fn from_pool_config(config: &PoolConfig) -> Self {
        let compatibility = config
            .compatibility
            .task_types()
            .map(|task| {
                let types = config
                    .compatibility
                    .worker_types_for(task)
                    .unwrap_or_default()
                    .iter()
                    .map(|t| t.as_str().to_string())
                    .collect();
                (task.to_string(), types)
            })
            .collect();

        DocketConfig {
            pool: Some(PoolSection {
                min_workers: Some(config.min_workers),
                max_workers: Some(config.max_workers),
                worker_types: Some(
                    config
                        .worker_types
                        .iter()
                        .map(|t| t.as_str().to_string())
                        .collect(),
                ),
                default_worker_type: Some(config.default_worker_type.as_str().to_string()),
                strategy: Some(config.strategy),
                default_task_timeout: Some(format_duration(config.default_task_timeout)),
            }),
            health: Some(HealthSection {
                enabled: Some(config.health.enabled),
                interval: Some(format_duration(config.health.interval)),
                staleness_threshold: Some(format_duration(config.health.staleness_threshold)),
                latency_reference: Some(format_duration(config.health.latency_reference)),
                restart_after_failures: Some(config.health.restart_after_failures),
                unhealthy_score: Some(config.health.unhealthy_score),
            }),
            scaling: Some(ScalingSection {
                enabled: Some(config.scaling.enabled),
                interval: Some(format_duration(config.scaling.interval)),
                scale_up_threshold: Some(config.scaling.scale_up_threshold),
                scale_down_threshold: Some(config.scaling.scale_down_threshold),
                scale_up_cooldown: Some(format_duration(config.scaling.scale_up_cooldown)),
                scale_down_cooldown: Some(format_duration(config.scaling.scale_down_cooldown)),
                emergency_factor: Some(config.scaling.emergency_factor),
            }),
            retry: Some(RetrySection {
                max_retries: Some(config.retry.max_retries),
                base_delay: Some(format_duration(config.retry.base_delay)),
                backoff_multiplier: Some(config.retry.backoff_multiplier),
                max_delay: Some(format_duration(config.retry.max_delay)),
            }),
            compatibility: Some(compatibility),
            executor: None,
        }
    }
}

fn overlay_duration(
    target: &mut Duration,
    field: &str,
    value: &Option<String>,
) -> Result<(), ConfigError> {
    if let Some(raw) = value {
        *target = parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field: field.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

// ── Runtime layer ──────────────────────────────────────────────────

/// How the pool picks among idle compatible workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    #[default]
    CapabilityBased,
}

/// Resolved, validated pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    /// One worker of each listed type is created on start.
    pub worker_types: Vec<WorkerType>,
    /// Type used when scaling up with an empty backlog.
    pub default_worker_type: WorkerType,
    pub strategy: LoadBalancingStrategy,
    /// Applied to tasks submitted without a timeout.
    pub default_task_timeout: Duration,
    pub compatibility: CompatibilityTable,
    pub health: HealthSettings,
    pub scaling: ScalingSettings,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 6,
            max_workers: 24,
            worker_types: WorkerType::ALL.to_vec(),
            default_worker_type: WorkerType::DocumentProcessor,
            strategy: LoadBalancingStrategy::default(),
            default_task_timeout: Duration::from_secs(30),
            compatibility: CompatibilityTable::default(),
            health: HealthSettings::default(),
            scaling: ScalingSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// A config with a single worker type and the given bounds.
    pub fn single_type(worker_type: WorkerType, min_workers: u32, max_workers: u32) -> Self {
        Self {
            min_workers,
            max_workers,
            worker_types: vec![worker_type],
            default_worker_type: worker_type,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers > self.max_workers {
            return Err(ConfigError::InvalidBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if self.min_workers == 0 {
            return Err(ConfigError::Invalid("min_workers must be at least 1".into()));
        }
        if self.worker_types.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one worker type is required".into(),
            ));
        }
        if self.worker_types.len() > self.max_workers as usize {
            return Err(ConfigError::Invalid(format!(
                "{} worker types configured but max_workers is {}",
                self.worker_types.len(),
                self.max_workers
            )));
        }
        for (i, t) in self.worker_types.iter().enumerate() {
            if self.worker_types[..i].contains(t) {
                return Err(ConfigError::Invalid(format!("worker type {t} listed twice")));
            }
        }
        if self.default_task_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default_task_timeout must be non-zero".into(),
            ));
        }
        self.health.validate()?;
        self.scaling.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval: Duration,
    /// A busy worker without a heartbeat for longer than this is presumed hung.
    pub staleness_threshold: Duration,
    /// Average processing time at which responsiveness contributes nothing.
    pub latency_reference: Duration,
    /// Consecutive failures that force a restart.
    pub restart_after_failures: u32,
    /// Idle workers scoring below this are restarted.
    pub unhealthy_score: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(120),
            latency_reference: Duration::from_millis(1000),
            restart_after_failures: 3,
            unhealthy_score: 0.25,
        }
    }
}

impl HealthSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.interval.is_zero() {
            return Err(ConfigError::Invalid("health.interval must be non-zero".into()));
        }
        if self.latency_reference.is_zero() {
            return Err(ConfigError::Invalid(
                "health.latency_reference must be non-zero".into(),
            ));
        }
        if self.restart_after_failures == 0 {
            return Err(ConfigError::Invalid(
                "health.restart_after_failures must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.unhealthy_score) {
            return Err(ConfigError::Invalid(format!(
                "health.unhealthy_score {} is outside [0, 1]",
                self.unhealthy_score
            )));
        }
        Ok(())
    }
}

/// Auto-scaler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Fraction of the pool kept after a critical resource alert.
    pub emergency_factor: f64,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            emergency_factor: 0.7,
        }
    }
}

impl ScalingSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.interval.is_zero() {
            return Err(ConfigError::Invalid("scaling.interval must be non-zero".into()));
        }
        let thresholds_ok = (0.0..=1.0).contains(&self.scale_down_threshold)
            && (0.0..=1.0).contains(&self.scale_up_threshold)
            && self.scale_down_threshold < self.scale_up_threshold;
        if !thresholds_ok {
            return Err(ConfigError::Invalid(format!(
                "scaling thresholds must satisfy 0 <= down ({}) < up ({}) <= 1",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if !(self.emergency_factor > 0.0 && self.emergency_factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scaling.emergency_factor {} is outside (0, 1]",
                self.emergency_factor
            )));
        }
        Ok(())
    }
}

/// Retry policy for failed tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Default for tasks that don't set their own limit.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_multiplier {} must be at least 1.0",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(
                "retry.max_delay must not be shorter than retry.base_delay".into(),
            ));
        }
        Ok(())
    }
}
