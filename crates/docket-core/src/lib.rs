pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{
    DocketConfig, HealthSettings, LoadBalancingStrategy, PoolConfig, RetryPolicy, ScalingSettings,
};
pub use duration::parse_duration;
pub use error::ConfigError;
pub use types::*;
