//! 执行端（Connector）
//!
//! 处理顺序固定：归属检查 → 配对检查 → 签名校验 → 签发时间窗口 → 重放保护 → 本地策略 → 执行。
//! 任何一步失败都不会调用 handler。同一 (owner, task id) 至多执行一次，重复投递直接回送缓存结果；
//! 缓存保留到计划本身过期为止，之后同一计划只会因超出时间窗口被拒。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{GateError, RejectReason};
use crate::executor::{ActionRegistry, ExecutionEngine};
use crate::identity::{parse_public_key, PairingRegistry};
use crate::policy::{PolicyDecision, PolicyEngine};
use crate::protocol::{
    ExecutionResult, PairDeviceRequest, PairDeviceResponse, TaskDispatchRequest, TaskPlan,
    WireMessage,
};
use crate::transport::{Envelope, Transport};

/// 签发时间允许比本机时钟超前的秒数
const MAX_CLOCK_SKEW_SECS: i64 = 60;

enum ReplayEntry {
    /// 正在执行；期间到达的重复投递直接丢弃，结果由首个投递负责回送
    InFlight,
    Done {
        result: ExecutionResult,
        issued_at: i64,
    },
}

type ReplayKey = (String, String);

/// 墙钟秒数，锚定在启动时刻、按 tokio 时钟推进
struct Clock {
    wall_at_start: i64,
    started: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            wall_at_start: chrono::Utc::now().timestamp(),
            started: Instant::now(),
        }
    }

    fn now_secs(&self) -> i64 {
        self.wall_at_start + self.started.elapsed().as_secs() as i64
    }
}

pub struct Connector {
    address: String,
    owner_id: String,
    device_id: String,
    registry: PairingRegistry,
    policy: PolicyEngine,
    engine: ExecutionEngine,
    replay: Mutex<HashMap<ReplayKey, ReplayEntry>>,
    replay_window_secs: i64,
    clock: Clock,
    transport: Arc<dyn Transport>,
}

impl Connector {
    pub fn new(
        address: impl Into<String>,
        config: &AppConfig,
        actions: ActionRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GateError> {
        Ok(Self {
            address: address.into(),
            owner_id: config.app.owner_id.clone(),
            device_id: config.app.device_id.clone(),
            registry: PairingRegistry::new(),
            policy: PolicyEngine::new("local", config.local_policy.clone())?,
            engine: ExecutionEngine::new(Arc::new(actions), config.executor.step_timeout_seconds),
            replay: Mutex::new(HashMap::new()),
            replay_window_secs: i64::try_from(config.executor.replay_ttl_seconds).unwrap_or(i64::MAX),
            clock: Clock::new(),
            transport,
        })
    }

    /// 替换本地策略引擎（测试里固定基准目录用）
    pub fn with_policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    pub fn pairings(&self) -> &PairingRegistry {
        &self.registry
    }

    pub async fn handle_pair_request(&self, request: PairDeviceRequest) -> PairDeviceResponse {
        let respond = |status: &str, message: String| PairDeviceResponse {
            owner_id: request.owner_id.clone(),
            device_id: request.device_id.clone(),
            status: status.to_string(),
            message,
        };

        if request.owner_id != self.owner_id {
            tracing::warn!(owner = %request.owner_id, "Pairing request from foreign owner");
            return respond("rejected", format!("Unknown owner: {}", request.owner_id));
        }
        if request.device_id != self.device_id {
            tracing::warn!(device = %request.device_id, "Pairing request for unknown device");
            return respond("rejected", format!("Unknown device: {}", request.device_id));
        }

        match self
            .registry
            .register(
                &request.owner_id,
                &request.device_id,
                &request.public_key,
                request.capabilities.iter().cloned(),
            )
            .await
        {
            Ok(_) => respond("paired", "Device paired".to_string()),
            Err(e) => respond("rejected", format!("{} ({})", e, e.reason_code())),
        }
    }

    /// 签发时间须落在 [now - 窗口, now + 时钟偏差] 内
    fn check_freshness(&self, plan: &TaskPlan, now: i64) -> Result<(), RejectReason> {
        let age = now.saturating_sub(plan.issued_at);
        if age > self.replay_window_secs || age < -MAX_CLOCK_SKEW_SECS {
            return Err(RejectReason::StalePlan);
        }
        Ok(())
    }

    /// 返回 `None` 表示同一 task id 正在执行，本次投递被丢弃
    pub async fn handle_dispatch(&self, request: &TaskDispatchRequest) -> Option<ExecutionResult> {
        if request.owner_id != self.owner_id {
            tracing::warn!(owner = %request.owner_id, device = %request.device_id, "Dispatch rejected: foreign owner");
            return Some(ExecutionResult::rejected(
                request.task_id_hint(),
                RejectReason::DeviceNotPaired,
            ));
        }

        let record = match self
            .registry
            .require_paired(&request.owner_id, &request.device_id)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(owner = %request.owner_id, device = %request.device_id, "Dispatch rejected: {}", e);
                return Some(ExecutionResult::rejected(request.task_id_hint(), e.reason()));
            }
        };

        let plan = match parse_public_key(&record.public_key)
            .map_err(|_| RejectReason::InvalidKey)
            .and_then(|key| request.envelope().open(&key).map_err(|e| e.reason()))
        {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::warn!(
                    signer = %request.signer_address,
                    device = %request.device_id,
                    "Dispatch rejected: {}",
                    reason
                );
                return Some(ExecutionResult::rejected(request.task_id_hint(), reason));
            }
        };

        let now = self.clock.now_secs();
        if let Err(reason) = self.check_freshness(&plan, now) {
            tracing::warn!(
                task_id = %plan.task_id,
                issued_at = plan.issued_at,
                now = now,
                "Dispatch rejected: outside replay window"
            );
            return Some(ExecutionResult::rejected(plan.task_id.clone(), reason));
        }

        let key = (request.owner_id.clone(), plan.task_id.clone());
        {
            let mut replay = self.replay.lock().await;
            let window = self.replay_window_secs;
            replay.retain(|_, entry| match entry {
                ReplayEntry::InFlight => true,
                ReplayEntry::Done { issued_at, .. } => now.saturating_sub(*issued_at) <= window,
            });
            match replay.get(&key) {
                Some(ReplayEntry::Done { result, .. }) => {
                    tracing::info!(task_id = %plan.task_id, "Replayed dispatch, resending cached result");
                    return Some(result.clone());
                }
                Some(ReplayEntry::InFlight) => {
                    tracing::info!(task_id = %plan.task_id, "Duplicate dispatch while executing, dropped");
                    return None;
                }
                None => {
                    replay.insert(key.clone(), ReplayEntry::InFlight);
                }
            }
        }

        let result = match self.policy.evaluate(&plan, &request.owner_id).await {
            PolicyDecision::Allow => self.engine.run(&plan).await,
            PolicyDecision::Reject(violation) => {
                ExecutionResult::rejected(plan.task_id.clone(), violation.reason())
            }
        };

        self.replay.lock().await.insert(
            key,
            ReplayEntry::Done {
                result: result.clone(),
                issued_at: plan.issued_at,
            },
        );
        Some(result)
    }

    #[cfg(test)]
    async fn replay_len(&self) -> usize {
        self.replay.lock().await.len()
    }

    pub async fn handle_envelope(&self, envelope: Envelope) {
        let reply = match envelope.message {
            WireMessage::PairDeviceRequest(request) => Some(WireMessage::PairDeviceResponse(
                self.handle_pair_request(request).await,
            )),
            WireMessage::TaskDispatchRequest(request) => self
                .handle_dispatch(&request)
                .await
                .map(WireMessage::TaskExecutionResult),
            other => {
                tracing::warn!(from = %envelope.from, kind = other.kind(), "Unexpected message for connector");
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = self.transport.send(&self.address, &envelope.from, reply).await {
                tracing::error!(to = %envelope.from, "Failed to send reply: {}", e);
            }
        }
    }
}

/// 以 actor 方式运行：每条入站消息在独立任务中处理
pub fn spawn_connector(
    connector: Arc<Connector>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = inbox.recv() => {
                    let Some(envelope) = msg else { break };
                    let connector = Arc::clone(&connector);
                    tokio::spawn(async move { connector.handle_envelope(envelope).await });
                }
            }
        }
        tracing::info!("Connector stopped");
    })
}
