//! 规划端（Orchestrator）
//!
//! 目标接入 → 回声过滤 → 规划 → 远端策略 → 登记关联 → 签名下发；结果异步回来后按 task id
//! 找回发起方并回复。设备地址只从配对响应中学到。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{CorrelationError, GateError, RejectReason};
use crate::dispatch::{format_rejection, DispatchCorrelator, OriginContext};
use crate::filter::{EchoFilter, FilterRejection};
use crate::identity::Identity;
use crate::planner::{PlanOutcome, Planner};
use crate::policy::{PolicyDecision, PolicyEngine};
use crate::protocol::{
    ExecutionResult, ExecutionStatus, PairDeviceRequest, PairDeviceResponse, SignedEnvelope,
    TaskDispatchRequest, WireMessage,
};
use crate::transport::{Envelope, Transport};

/// 发给最终用户的回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub origin: OriginContext,
    pub text: String,
}

/// 一次目标接入的去向
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectiveOutcome {
    Filtered(FilterRejection),
    CannotPlan(String),
    Rejected { task_id: String, reason: RejectReason },
    Dropped(CorrelationError),
    Dispatched { task_id: String },
}

type DeviceKey = (String, String);

pub struct Orchestrator {
    address: String,
    identity: Identity,
    owner_id: String,
    device_id: String,
    filter: EchoFilter,
    planner: Arc<dyn Planner>,
    policy: PolicyEngine,
    correlator: Arc<DispatchCorrelator>,
    transport: Arc<dyn Transport>,
    reply_on_rejection: bool,
    /// 已配对设备 → 执行端地址
    devices: RwLock<HashMap<DeviceKey, String>>,
    /// 已发出、尚未收到响应的配对请求 → 目标地址
    pairing_requests: Mutex<HashMap<DeviceKey, String>>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl Orchestrator {
    /// 返回 orchestrator 与用户回复的接收端
    pub fn new(
        address: impl Into<String>,
        identity: Identity,
        config: &AppConfig,
        planner: Arc<dyn Planner>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Reply>), GateError> {
        let policy = PolicyEngine::new("remote", config.remote_policy.clone())?;
        let correlator = Arc::new(DispatchCorrelator::new(&config.correlator));
        let filter = EchoFilter::new(config.filter.clone()).with_correlator(correlator.clone());
        let (replies, replies_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                address: address.into(),
                identity,
                owner_id: config.app.owner_id.clone(),
                device_id: config.app.device_id.clone(),
                filter,
                planner,
                policy,
                correlator,
                transport,
                reply_on_rejection: config.orchestrator.reply_on_rejection,
                devices: RwLock::new(HashMap::new()),
                pairing_requests: Mutex::new(HashMap::new()),
                replies,
            },
            replies_rx,
        ))
    }

    /// 替换远端策略引擎（测试里固定基准目录用）
    pub fn with_policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn correlator(&self) -> &Arc<DispatchCorrelator> {
        &self.correlator
    }

    pub async fn device_address(&self, owner_id: &str, device_id: &str) -> Option<String> {
        self.devices
            .read()
            .await
            .get(&(owner_id.to_string(), device_id.to_string()))
            .cloned()
    }

    /// 向执行端申请配对：把本端公钥登记为该设备的受信签名方
    pub async fn request_pairing(
        &self,
        connector_address: &str,
        capabilities: Vec<String>,
    ) -> Result<(), GateError> {
        let key = (self.owner_id.clone(), self.device_id.clone());
        self.pairing_requests
            .lock()
            .await
            .insert(key, connector_address.to_string());

        let request = PairDeviceRequest {
            owner_id: self.owner_id.clone(),
            device_id: self.device_id.clone(),
            public_key: self.identity.public_key_hex(),
            capabilities,
        };
        tracing::info!(
            owner = %self.owner_id,
            device = %self.device_id,
            "Requesting pairing with {}",
            connector_address
        );
        self.transport
            .send(&self.address, connector_address, WireMessage::PairDeviceRequest(request))
            .await?;
        Ok(())
    }

    pub async fn handle_pair_response(&self, from: &str, response: PairDeviceResponse) {
        let key = (response.owner_id.clone(), response.device_id.clone());
        let expected = self.pairing_requests.lock().await.remove(&key);
        if expected.as_deref() != Some(from) {
            tracing::warn!(from = %from, device = %response.device_id, "Unsolicited pairing response ignored");
            return;
        }
        if response.is_paired() {
            tracing::info!(owner = %response.owner_id, device = %response.device_id, "Device paired at {}", from);
            self.devices.write().await.insert(key, from.to_string());
        } else {
            tracing::warn!(
                owner = %response.owner_id,
                device = %response.device_id,
                "Pairing rejected: {}",
                response.message
            );
        }
    }

    fn reply(&self, origin: OriginContext, text: String) {
        if self.replies.send(Reply { origin, text }).is_err() {
            tracing::warn!("Reply channel closed");
        }
    }

    fn reject(&self, origin: OriginContext, task_id: String, reason: RejectReason) -> ObjectiveOutcome {
        if self.reply_on_rejection {
            self.reply(origin, format_rejection(&task_id, reason));
        }
        ObjectiveOutcome::Rejected { task_id, reason }
    }

    /// 目标接入；被过滤、无法规划、被拒或被丢弃都不算错误，只有传输失败返回 Err
    pub async fn handle_objective(
        &self,
        sender_id: &str,
        text: &str,
    ) -> Result<ObjectiveOutcome, GateError> {
        let objective = match self.filter.screen(sender_id, text).await {
            Ok(cleaned) => cleaned,
            Err(reason) => {
                tracing::warn!(sender = %sender_id, "Objective dropped: {}", reason);
                return Ok(ObjectiveOutcome::Filtered(reason));
            }
        };

        let plan = match self.planner.plan(&objective).await {
            PlanOutcome::Plan(plan) => plan,
            PlanOutcome::CannotPlan(why) => {
                tracing::warn!(sender = %sender_id, "Cannot plan objective: {}", why);
                return Ok(ObjectiveOutcome::CannotPlan(why));
            }
        };
        let origin = OriginContext::new(sender_id, objective);

        let Some(connector) = self.device_address(&self.owner_id, &self.device_id).await else {
            tracing::warn!(task_id = %plan.task_id, device = %self.device_id, "No paired device for dispatch");
            return Ok(self.reject(origin, plan.task_id, RejectReason::DeviceNotPaired));
        };

        if let PolicyDecision::Reject(violation) = self.policy.evaluate(&plan, sender_id).await {
            return Ok(self.reject(origin, plan.task_id, violation.reason()));
        }

        if let Err(err) = self.correlator.on_dispatch(&plan.task_id, &connector, origin).await {
            tracing::warn!(task_id = %plan.task_id, sender = %sender_id, "Dispatch dropped: {}", err);
            return Ok(ObjectiveOutcome::Dropped(err));
        }

        let envelope = match SignedEnvelope::seal(&self.identity, &plan) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.correlator.cancel(&plan.task_id).await;
                return Err(e);
            }
        };
        let request = TaskDispatchRequest::new(&self.owner_id, &self.device_id, envelope);
        if let Err(e) = self
            .transport
            .send(&self.address, &connector, WireMessage::TaskDispatchRequest(request))
            .await
        {
            self.correlator.cancel(&plan.task_id).await;
            return Err(e.into());
        }

        tracing::info!(
            task_id = %plan.task_id,
            sender = %sender_id,
            steps = plan.steps.len(),
            "Task dispatched to {}",
            connector
        );
        Ok(ObjectiveOutcome::Dispatched {
            task_id: plan.task_id,
        })
    }

    /// `from` 必须是该任务下发时的目标地址，否则结果被丢弃
    pub async fn handle_execution_result(&self, from: &str, result: ExecutionResult) {
        let Some((origin, text)) = self.correlator.on_result(from, &result).await else {
            return;
        };
        if result.status == ExecutionStatus::Rejected && !self.reply_on_rejection {
            tracing::info!(task_id = %result.task_id, "Rejection not relayed");
            return;
        }
        self.reply(origin, text);
    }

    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.message {
            WireMessage::PairDeviceResponse(resp) => {
                self.handle_pair_response(&envelope.from, resp).await
            }
            WireMessage::TaskExecutionResult(result) => {
                self.handle_execution_result(&envelope.from, result).await
            }
            other => {
                tracing::warn!(from = %envelope.from, kind = other.kind(), "Unexpected message for orchestrator")
            }
        }
    }
}

/// 以 actor 方式运行：每条入站消息在独立任务中处理；同时启动关联器的清理循环
pub fn spawn_orchestrator(
    orchestrator: Arc<Orchestrator>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let prune_token = token.child_token();
        let prune = orchestrator.correlator().spawn_prune_loop(prune_token.clone());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = inbox.recv() => {
                    let Some(envelope) = msg else { break };
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move { orchestrator.handle_envelope(envelope).await });
                }
            }
        }
        prune_token.cancel();
        let _ = prune.await;
        tracing::info!("Orchestrator stopped");
    })
}
