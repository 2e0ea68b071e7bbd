//! 策略层：同一套引擎分别在规划端与执行端独立实例化

pub mod config;
pub mod engine;
pub mod paths;
pub mod rate_limit;

pub use config::{PolicyConfig, RateLimitConfig, LOCAL_DEFAULT_ACTIONS, REMOTE_DEFAULT_ACTIONS};
pub use engine::{resolve_dirs, PolicyDecision, PolicyEngine};
pub use rate_limit::SlidingWindowLimiter;
