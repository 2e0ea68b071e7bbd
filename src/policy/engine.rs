//! 策略引擎
//!
//! 规划端与执行端各持一个实例、各自配置，互不知晓；最终放行 = 两边都放行。
//! 检查顺序：步数上限 → 逐步（动作白名单 → 路径前缀）→ 限流，第一个违规即返回。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use super::config::PolicyConfig;
use super::paths::{is_under_any, normalize, path_values};
use super::rate_limit::SlidingWindowLimiter;
use crate::core::error::{GateError, PolicyViolation};
use crate::protocol::TaskPlan;

/// 策略判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Reject(PolicyViolation),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// 返回（基准目录, home）。配置的基准目录做 `~` 展开，相对值拼到进程当前目录
pub fn resolve_dirs(config: &PolicyConfig) -> Result<(PathBuf, PathBuf), GateError> {
    resolve_dirs_from(
        config,
        std::env::current_dir(),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

fn resolve_dirs_from(
    config: &PolicyConfig,
    cwd: std::io::Result<PathBuf>,
    home: Option<PathBuf>,
) -> Result<(PathBuf, PathBuf), GateError> {
    let cwd = cwd.map_err(|e| GateError::Config(format!("cannot read current directory: {}", e)))?;
    let home = home.unwrap_or_else(|| cwd.clone());
    let base_dir = match &config.base_dir {
        Some(dir) => normalize(&dir.to_string_lossy(), &cwd, &home),
        None => cwd,
    };
    Ok((base_dir, home))
}

pub struct PolicyEngine {
    name: String,
    config: PolicyConfig,
    allowed_actions: HashSet<String>,
    base_dir: PathBuf,
    home: PathBuf,
    prefixes: Vec<PathBuf>,
    limiter: SlidingWindowLimiter,
}

impl PolicyEngine {
    /// `name` 只用于日志（如 "remote" / "local"）；读不到进程当前目录时失败
    pub fn new(name: impl Into<String>, config: PolicyConfig) -> Result<Self, GateError> {
        let (base_dir, home) = resolve_dirs(&config)?;
        Ok(Self::with_dirs(name, config, base_dir, home))
    }

    /// 显式指定基准目录与 home（测试与嵌入场景）
    pub fn with_dirs(
        name: impl Into<String>,
        config: PolicyConfig,
        base_dir: PathBuf,
        home: PathBuf,
    ) -> Self {
        let prefixes = config
            .allowed_path_prefixes
            .iter()
            .map(|p| normalize(p, &base_dir, &home))
            .collect();
        let limiter = SlidingWindowLimiter::new(
            Duration::from_secs(config.rate_limit.window_seconds),
            config.rate_limit.max_requests,
        );
        Self {
            name: name.into(),
            allowed_actions: config.allowed_actions.iter().cloned().collect(),
            config,
            base_dir,
            home,
            prefixes,
            limiter,
        }
    }

    /// 不计入限流窗口的静态检查
    pub fn check_plan(&self, plan: &TaskPlan) -> Result<(), PolicyViolation> {
        let max = plan
            .constraints
            .max_steps
            .map_or(self.config.max_steps, |m| m.min(self.config.max_steps));
        if plan.steps.len() > max {
            return Err(PolicyViolation::TooManySteps {
                steps: plan.steps.len(),
                max,
            });
        }

        for step in &plan.steps {
            if !self.allowed_actions.contains(&step.action) {
                return Err(PolicyViolation::ActionNotAllowed(step.action.clone()));
            }
            for raw in path_values(&step.params) {
                let resolved = normalize(&raw, &self.base_dir, &self.home);
                if !is_under_any(&resolved, &self.prefixes) {
                    return Err(PolicyViolation::PathNotAllowed(raw));
                }
            }
        }
        Ok(())
    }

    pub async fn evaluate(&self, plan: &TaskPlan, requester: &str) -> PolicyDecision {
        if let Err(violation) = self.check_plan(plan) {
            tracing::warn!(
                policy = %self.name,
                task_id = %plan.task_id,
                requester = %requester,
                reason = %violation.reason_code(),
                "Plan rejected: {}", violation
            );
            return PolicyDecision::Reject(violation);
        }

        if !self.limiter.try_acquire(requester).await {
            let violation = PolicyViolation::RateLimited(format!(
                "{} requests per {}s",
                self.config.rate_limit.max_requests, self.config.rate_limit.window_seconds
            ));
            tracing::warn!(
                policy = %self.name,
                task_id = %plan.task_id,
                requester = %requester,
                "Plan rejected: rate limited"
            );
            return PolicyDecision::Reject(violation);
        }

        tracing::debug!(policy = %self.name, task_id = %plan.task_id, "Plan allowed");
        PolicyDecision::Allow
    }
}
