//! 任务计划与执行结果的数据模型
//!
//! 字段名一律 snake_case；`TaskPlan` 一经签名即视为不可变。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::RejectReason;

/// 步骤类型：本地操作 / 对外发送
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub kind: StepKind,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TaskStep {
    pub fn local(action: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            kind: StepKind::Local,
            action: action.into(),
            params,
        }
    }

    pub fn external(action: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            kind: StepKind::External,
            action: action.into(),
            params,
        }
    }
}

/// 计划自带的约束；`max_steps` 与策略上限取较小值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub max_steps: Option<usize>,
    pub require_confirmation: bool,
    pub no_destructive: bool,
    pub max_duration_seconds: u64,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            max_steps: None,
            require_confirmation: false,
            no_destructive: true,
            max_duration_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub task_id: String,
    /// 签发时间（unix 秒），随计划一起签名
    pub issued_at: i64,
    pub steps: Vec<TaskStep>,
    pub constraints: TaskConstraints,
}

impl TaskPlan {
    /// 新计划总是拿到新的 task id（重试也不复用）
    pub fn new(steps: Vec<TaskStep>, constraints: TaskConstraints) -> Self {
        Self {
            task_id: new_task_id(),
            issued_at: chrono::Utc::now().timestamp(),
            steps,
            constraints,
        }
    }
}

/// `task_` + 32 位小写十六进制
pub fn new_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub action: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Rejected,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// 执行结果，产生后即为终态；`reason` 只在 `rejected` 时出现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl ExecutionResult {
    pub fn rejected(task_id: impl Into<String>, reason: RejectReason) -> Self {
        Self {
            task_id: task_id.into(),
            status: ExecutionStatus::Rejected,
            step_results: Vec::new(),
            outputs: Map::new(),
            reason: Some(reason),
        }
    }
}
