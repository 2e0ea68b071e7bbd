//! 协议错误分类与原因码
//!
//! 五类错误：配对（Pairing）/ 签名（Signature）/ 策略（Policy）/ 执行（Execution）/ 关联（Correlation）。
//! 前三类可归因到具体请求方，带原因码回报给直接调用方，协议不自动重试；
//! 执行错误只中止本计划剩余步骤；关联错误没有可达的发起方，只记日志。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 线上传输的拒绝原因码（snake_case 字符串）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidKey,
    AlreadyPaired,
    DeviceNotPaired,
    /// Missing / Malformed / Invalid 三种签名失败对外一律报这个
    InvalidSignature,
    ActionNotAllowed,
    PathNotAllowed,
    TooManySteps,
    RateLimited,
    /// 签发时间超出重放窗口（过旧或来自未来）
    StalePlan,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidKey => "invalid_key",
            RejectReason::AlreadyPaired => "already_paired",
            RejectReason::DeviceNotPaired => "device_not_paired",
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::ActionNotAllowed => "action_not_allowed",
            RejectReason::PathNotAllowed => "path_not_allowed",
            RejectReason::TooManySteps => "too_many_steps",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::StalePlan => "stale_plan",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配对错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Device {owner_id}/{device_id} is already paired with a different key")]
    AlreadyPaired { owner_id: String, device_id: String },

    #[error("Device {owner_id}/{device_id} is not paired")]
    NotPaired { owner_id: String, device_id: String },
}

impl PairingError {
    pub fn reason_code(&self) -> &'static str {
        self.reason().as_str()
    }

    pub fn reason(&self) -> RejectReason {
        match self {
            PairingError::InvalidKey(_) => RejectReason::InvalidKey,
            PairingError::AlreadyPaired { .. } => RejectReason::AlreadyPaired,
            PairingError::NotPaired { .. } => RejectReason::DeviceNotPaired,
        }
    }
}

/// 签名校验错误；下游对三者一视同仁，不存在「部分信任」
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature missing")]
    Missing,

    #[error("Signature malformed: {0}")]
    Malformed(String),

    #[error("Signature invalid")]
    Invalid,
}

impl SignatureError {
    pub fn reason_code(&self) -> &'static str {
        self.reason().as_str()
    }

    pub fn reason(&self) -> RejectReason {
        RejectReason::InvalidSignature
    }
}

/// 策略违规（第一个违规即短路）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("Action not allowed: {0}")]
    ActionNotAllowed(String),

    #[error("Path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("Too many steps: {steps} (max {max})")]
    TooManySteps { steps: usize, max: usize },

    #[error("Rate limited: {0}")]
    RateLimited(String),
}

impl PolicyViolation {
    pub fn reason_code(&self) -> &'static str {
        self.reason().as_str()
    }

    pub fn reason(&self) -> RejectReason {
        match self {
            PolicyViolation::ActionNotAllowed(_) => RejectReason::ActionNotAllowed,
            PolicyViolation::PathNotAllowed(_) => RejectReason::PathNotAllowed,
            PolicyViolation::TooManySteps { .. } => RejectReason::TooManySteps,
            PolicyViolation::RateLimited(_) => RejectReason::RateLimited,
        }
    }
}

/// 单步执行错误；只中止本计划剩余步骤
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Timeout")]
    Timeout,
}

/// 关联错误：结果找不到发起方，或待办表拒绝新条目
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Unknown task id: {0}")]
    UnknownTaskId(String),

    #[error("Pending dispatch expired: {0}")]
    Expired(String),

    #[error("Sender {sender_id} reached the pending dispatch limit ({limit})")]
    PendingLimit { sender_id: String, limit: usize },

    #[error("Task id already pending: {0}")]
    DuplicateTaskId(String),

    #[error("Result for {task_id} came from {from}, not the dispatched device")]
    UnexpectedSender { task_id: String, from: String },
}

/// 顶层错误，供节点与二进制使用
#[derive(Error, Debug)]
pub enum GateError {
    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error("Invalid task plan: {0}")]
    InvalidPlan(String),

    #[error("Key storage error: {0}")]
    KeyStorage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// 可归因到请求方的错误才有原因码
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            GateError::Pairing(e) => Some(e.reason()),
            GateError::Signature(e) => Some(e.reason()),
            GateError::Policy(e) => Some(e.reason()),
            _ => None,
        }
    }
}
