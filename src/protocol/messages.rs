//! 线上消息格式（JSON，`type` 字段区分）

use serde::{Deserialize, Serialize};

use super::plan::ExecutionResult;
use super::signer::SignedEnvelope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairDeviceRequest {
    pub owner_id: String,
    pub device_id: String,
    /// 规划端公钥（64 位十六进制）
    pub public_key: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairDeviceResponse {
    pub owner_id: String,
    pub device_id: String,
    /// `paired` / `rejected`
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl PairDeviceResponse {
    pub fn is_paired(&self) -> bool {
        self.status == "paired"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatchRequest {
    pub owner_id: String,
    pub device_id: String,
    pub task_plan_canonical: String,
    pub signer_address: String,
    pub signature: String,
}

impl TaskDispatchRequest {
    pub fn new(owner_id: &str, device_id: &str, envelope: SignedEnvelope) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            device_id: device_id.to_string(),
            task_plan_canonical: envelope.payload,
            signer_address: envelope.signer_address,
            signature: envelope.signature,
        }
    }

    pub fn envelope(&self) -> SignedEnvelope {
        SignedEnvelope {
            payload: self.task_plan_canonical.clone(),
            signer_address: self.signer_address.clone(),
            signature: self.signature.clone(),
        }
    }

    /// 尽力从载荷里取出 task id，用于拒绝时仍能把结果路由回发起方
    pub fn task_id_hint(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.task_plan_canonical)
            .ok()
            .and_then(|v| v.get("task_id").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_default()
    }
}

/// 两方之间流动的全部消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    PairDeviceRequest(PairDeviceRequest),
    PairDeviceResponse(PairDeviceResponse),
    TaskDispatchRequest(TaskDispatchRequest),
    TaskExecutionResult(ExecutionResult),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::PairDeviceRequest(_) => "pair_device_request",
            WireMessage::PairDeviceResponse(_) => "pair_device_response",
            WireMessage::TaskDispatchRequest(_) => "task_dispatch_request",
            WireMessage::TaskExecutionResult(_) => "task_execution_result",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::plan::ExecutionStatus;
    use serde_json::json;

    #[test]
    fn test_tagged_wire_format() {
        let msg = WireMessage::PairDeviceRequest(PairDeviceRequest {
            owner_id: "u1".into(),
            device_id: "d1".into(),
            public_key: "ab".repeat(32),
            capabilities: vec!["weekly_report".into()],
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], json!("pair_device_request"));
        assert_eq!(v["owner_id"], json!("u1"));
        assert_eq!(msg.kind(), "pair_device_request");
    }

    #[test]
    fn test_parse_execution_result() {
        let raw = json!({
            "type": "task_execution_result",
            "task_id": "task_abc",
            "status": "rejected",
            "reason": "invalid_signature"
        });
        let msg: WireMessage = serde_json::from_value(raw).unwrap();
        match msg {
            WireMessage::TaskExecutionResult(r) => {
                assert_eq!(r.status, ExecutionStatus::Rejected);
                assert!(r.step_results.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_task_id_hint() {
        let req = TaskDispatchRequest {
            owner_id: "u1".into(),
            device_id: "d1".into(),
            task_plan_canonical: r#"{"steps":[],"task_id":"task_42"}"#.into(),
            signer_address: String::new(),
            signature: String::new(),
        };
        assert_eq!(req.task_id_hint(), "task_42");

        let garbage = TaskDispatchRequest {
            task_plan_canonical: "{{".into(),
            ..req
        };
        assert_eq!(garbage.task_id_hint(), "");
    }
}
