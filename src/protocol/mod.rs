//! 协议层：计划数据模型、规范编码、签名信封、线上消息

pub mod canonical;
pub mod messages;
pub mod plan;
pub mod signer;

pub use canonical::{from_canonical_bytes, to_canonical_bytes};
pub use messages::{PairDeviceRequest, PairDeviceResponse, TaskDispatchRequest, WireMessage};
pub use plan::{
    new_task_id, ExecutionResult, ExecutionStatus, StepKind, StepResult, StepStatus,
    TaskConstraints, TaskPlan, TaskStep,
};
pub use signer::{sign, sign_bytes, verify, verify_bytes, SignedEnvelope};
