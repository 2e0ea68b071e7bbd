//! 执行引擎
//!
//! 严格按顺序执行计划步骤，每步把上一步输出传给下一步；第一处失败后其余步骤记为 skipped。
//! 每次调用在独立任务中运行并加超时，处理函数 panic 被隔离为 HandlerFailure；不自动重试。
//! 每步输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use super::registry::{ActionOutput, ActionRegistry};
use crate::core::error::ExecutionError;
use crate::protocol::{ExecutionResult, ExecutionStatus, StepResult, StepStatus, TaskPlan};

pub struct ExecutionEngine {
    registry: Arc<ActionRegistry>,
    step_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ActionRegistry>, step_timeout_secs: u64) -> Self {
        Self {
            registry,
            step_timeout: Duration::from_secs(step_timeout_secs),
        }
    }

    /// 单步超时 = min(引擎配置, 计划的 max_duration_seconds)；后者为 0 表示不限
    fn effective_timeout(&self, plan: &TaskPlan) -> Duration {
        match plan.constraints.max_duration_seconds {
            0 => self.step_timeout,
            secs => self.step_timeout.min(Duration::from_secs(secs)),
        }
    }

    pub async fn run(&self, plan: &TaskPlan) -> ExecutionResult {
        let step_timeout = self.effective_timeout(plan);
        let total = plan.steps.len();
        let mut step_results = Vec::with_capacity(total);
        let mut outputs = Map::new();
        let mut previous_output = ActionOutput::new();
        let mut failed = false;

        for (idx, step) in plan.steps.iter().enumerate() {
            if failed {
                step_results.push(StepResult {
                    action: step.action.clone(),
                    status: StepStatus::Skipped,
                    output: Map::new(),
                    error: None,
                });
                continue;
            }

            tracing::info!(
                task_id = %plan.task_id,
                "Step {}/{} - {}",
                idx + 1,
                total,
                step.action
            );
            let start = Instant::now();
            let result = self
                .run_step(&step.action, step.params.clone(), previous_output.clone(), step_timeout)
                .await;
            audit(&plan.task_id, &step.action, &step.params, &result, start);

            match result {
                Ok(output) => {
                    outputs.insert(step.action.clone(), Value::Object(output.clone()));
                    step_results.push(StepResult {
                        action: step.action.clone(),
                        status: StepStatus::Completed,
                        output: output.clone(),
                        error: None,
                    });
                    previous_output = output;
                }
                Err(err) => {
                    tracing::warn!(task_id = %plan.task_id, action = %step.action, "Step failed: {}", err);
                    step_results.push(StepResult {
                        action: step.action.clone(),
                        status: StepStatus::Failed,
                        output: Map::new(),
                        error: Some(err.to_string()),
                    });
                    failed = true;
                }
            }
        }

        ExecutionResult {
            task_id: plan.task_id.clone(),
            status: if failed {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            },
            step_results,
            outputs,
            reason: None,
        }
    }

    async fn run_step(
        &self,
        action: &str,
        params: Map<String, Value>,
        previous_output: ActionOutput,
        step_timeout: Duration,
    ) -> Result<ActionOutput, ExecutionError> {
        let handler = self
            .registry
            .get(action)
            .ok_or_else(|| ExecutionError::HandlerFailure(format!("Unknown action: {}", action)))?;

        let mut join = tokio::spawn(async move { handler.handle(params, previous_output).await });
        match timeout(step_timeout, &mut join).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(ExecutionError::HandlerFailure(e)),
            Ok(Err(join_err)) => Err(ExecutionError::HandlerFailure(if join_err.is_panic() {
                format!("handler panicked in {}", action)
            } else {
                format!("handler cancelled in {}", action)
            })),
            Err(_) => {
                join.abort();
                Err(ExecutionError::Timeout)
            }
        }
    }
}

fn audit(
    task_id: &str,
    action: &str,
    params: &Map<String, Value>,
    result: &Result<ActionOutput, ExecutionError>,
    start: Instant,
) {
    let (ok, outcome) = match result {
        Ok(_) => (true, "ok"),
        Err(ExecutionError::Timeout) => (false, "timeout"),
        Err(ExecutionError::HandlerFailure(_)) => (false, "error"),
    };
    let audit = serde_json::json!({
        "event": "step_audit",
        "task_id": task_id,
        "action": action,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "params_preview": params_preview(params),
    });
    tracing::info!(audit = %audit.to_string(), "step");
}

fn params_preview(params: &Map<String, Value>) -> String {
    let s = Value::Object(params.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
