//! 下发关联器
//!
//! 记录每个在途下发的发起方上下文与目标设备地址，结果异步到达时按 task id 找回发起方；
//! 只接受来自目标设备地址的结果。
//! 每个 task id 至多一条待办；待办超时后被清理（后台循环 + 每次下发时顺带清理），
//! 已清理的 id 留在有界墓碑表里，迟到的结果据此记为 Expired 而非 UnknownTaskId。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::response::format_execution_result;
use crate::config::CorrelatorSection;
use crate::core::error::CorrelationError;
use crate::protocol::ExecutionResult;

/// 发起方上下文：结果回来后要回复给谁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginContext {
    pub sender_id: String,
    pub objective: String,
}

impl OriginContext {
    pub fn new(sender_id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            objective: objective.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingDispatch {
    pub task_id: String,
    pub origin: OriginContext,
    /// 下发目标；结果必须从这个地址回来
    pub device_address: String,
    pub dispatched_at: Instant,
}

#[derive(Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn insert(&mut self, task_id: String, capacity: usize) {
        if capacity == 0 || !self.ids.insert(task_id.clone()) {
            return;
        }
        self.order.push_back(task_id);
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, task_id: &str) -> bool {
        self.ids.contains(task_id)
    }
}

#[derive(Default)]
struct State {
    pending: HashMap<String, PendingDispatch>,
    tombstones: Tombstones,
}

pub struct DispatchCorrelator {
    ttl: Duration,
    max_pending_per_sender: usize,
    prune_interval: Duration,
    tombstone_capacity: usize,
    state: Mutex<State>,
}

impl DispatchCorrelator {
    pub fn new(config: &CorrelatorSection) -> Self {
        Self {
            ttl: Duration::from_secs(config.pending_ttl_seconds),
            max_pending_per_sender: config.max_pending_per_sender,
            prune_interval: Duration::from_secs(config.prune_interval_seconds.max(1)),
            tombstone_capacity: config.tombstone_capacity,
            state: Mutex::new(State::default()),
        }
    }

    pub fn max_pending_per_sender(&self) -> usize {
        self.max_pending_per_sender
    }

    fn prune_locked(&self, state: &mut State, now: Instant) -> usize {
        let expired: Vec<String> = state
            .pending
            .values()
            .filter(|p| now.duration_since(p.dispatched_at) >= self.ttl)
            .map(|p| p.task_id.clone())
            .collect();
        for task_id in &expired {
            state.pending.remove(task_id);
            tracing::warn!(task_id = %task_id, "Pending dispatch expired without a result");
            state.tombstones.insert(task_id.clone(), self.tombstone_capacity);
        }
        expired.len()
    }

    /// 登记一次下发；同一 task id 重复登记、或发送方已达上限时拒绝
    pub async fn on_dispatch(
        &self,
        task_id: &str,
        device_address: &str,
        origin: OriginContext,
    ) -> Result<(), CorrelationError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        self.prune_locked(&mut state, now);

        if state.pending.contains_key(task_id) {
            return Err(CorrelationError::DuplicateTaskId(task_id.to_string()));
        }
        let in_flight = state
            .pending
            .values()
            .filter(|p| p.origin.sender_id == origin.sender_id)
            .count();
        if in_flight >= self.max_pending_per_sender {
            return Err(CorrelationError::PendingLimit {
                sender_id: origin.sender_id,
                limit: self.max_pending_per_sender,
            });
        }

        tracing::debug!(task_id = %task_id, sender = %origin.sender_id, "Dispatch registered");
        state.pending.insert(
            task_id.to_string(),
            PendingDispatch {
                task_id: task_id.to_string(),
                origin,
                device_address: device_address.to_string(),
                dispatched_at: now,
            },
        );
        Ok(())
    }

    /// 登记失败的回滚（下发没能送出时调用）
    pub async fn cancel(&self, task_id: &str) -> Option<PendingDispatch> {
        self.state.lock().await.pending.remove(task_id)
    }

    /// 把结果路由回发起方并格式化回复；找不到发起方或来源不符只记日志
    pub async fn on_result(
        &self,
        from: &str,
        result: &ExecutionResult,
    ) -> Option<(OriginContext, String)> {
        match self.take(&result.task_id, from).await {
            Ok(pending) => {
                tracing::info!(
                    task_id = %result.task_id,
                    sender = %pending.origin.sender_id,
                    status = %result.status,
                    "Result correlated"
                );
                Some((pending.origin, format_execution_result(result)))
            }
            Err(err) => {
                tracing::warn!(task_id = %result.task_id, "Dropping result: {}", err);
                None
            }
        }
    }

    async fn take(&self, task_id: &str, from: &str) -> Result<PendingDispatch, CorrelationError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        // 来源不符时待办保持原样，真正的结果仍可认领
        if let Some(p) = state.pending.get(task_id) {
            if p.device_address != from {
                return Err(CorrelationError::UnexpectedSender {
                    task_id: task_id.to_string(),
                    from: from.to_string(),
                });
            }
        }
        match state.pending.remove(task_id) {
            Some(p) if now.duration_since(p.dispatched_at) >= self.ttl => {
                state.tombstones.insert(task_id.to_string(), self.tombstone_capacity);
                Err(CorrelationError::Expired(task_id.to_string()))
            }
            Some(p) => Ok(p),
            None if state.tombstones.contains(task_id) => {
                Err(CorrelationError::Expired(task_id.to_string()))
            }
            None => Err(CorrelationError::UnknownTaskId(task_id.to_string())),
        }
    }

    pub async fn prune_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        self.prune_locked(&mut state, Instant::now())
    }

    /// 发送方当前在途数（先清理过期）
    pub async fn pending_count_for(&self, sender_id: &str) -> usize {
        let mut state = self.state.lock().await;
        self.prune_locked(&mut state, Instant::now());
        state
            .pending
            .values()
            .filter(|p| p.origin.sender_id == sender_id)
            .count()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// 后台清理循环，token 取消后退出
    pub fn spawn_prune_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(correlator.prune_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = correlator.prune_expired().await;
                        if pruned > 0 {
                            tracing::info!("Pruned {} expired dispatches", pruned);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExecutionStatus;
    use serde_json::Map;

    fn config(ttl: u64, cap: usize) -> CorrelatorSection {
        CorrelatorSection {
            pending_ttl_seconds: ttl,
            max_pending_per_sender: cap,
            prune_interval_seconds: 1,
            tombstone_capacity: 4,
        }
    }

    fn result(task_id: &str) -> ExecutionResult {
        ExecutionResult {
            task_id: task_id.to_string(),
            status: ExecutionStatus::Completed,
            step_results: vec![],
            outputs: Map::new(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_result_routes_to_origin_once() {
        let c = DispatchCorrelator::new(&config(600, 5));
        c.on_dispatch("task_a", "connector", OriginContext::new("s1", "scan")).await.unwrap();
        let (origin, reply) = c.on_result("connector", &result("task_a")).await.unwrap();
        assert_eq!(origin.sender_id, "s1");
        assert!(reply.contains("task_a"));
        assert!(c.on_result("connector", &result("task_a")).await.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_results() {
        let c = DispatchCorrelator::new(&config(600, 5));
        c.on_dispatch("task_1", "connector", OriginContext::new("s1", "one")).await.unwrap();
        c.on_dispatch("task_2", "connector", OriginContext::new("s2", "two")).await.unwrap();
        let (o2, _) = c.on_result("connector", &result("task_2")).await.unwrap();
        let (o1, _) = c.on_result("connector", &result("task_1")).await.unwrap();
        assert_eq!(o2.sender_id, "s2");
        assert_eq!(o1.sender_id, "s1");
    }

    #[tokio::test]
    async fn test_duplicate_and_limit() {
        let c = DispatchCorrelator::new(&config(600, 2));
        c.on_dispatch("t1", "connector", OriginContext::new("s1", "a")).await.unwrap();
        assert_eq!(
            c.on_dispatch("t1", "connector", OriginContext::new("s1", "a")).await,
            Err(CorrelationError::DuplicateTaskId("t1".into()))
        );
        c.on_dispatch("t2", "connector", OriginContext::new("s1", "b")).await.unwrap();
        assert!(matches!(
            c.on_dispatch("t3", "connector", OriginContext::new("s1", "c")).await,
            Err(CorrelationError::PendingLimit { limit: 2, .. })
        ));
        c.on_dispatch("t4", "connector", OriginContext::new("s2", "d")).await.unwrap();
        assert_eq!(c.pending_count_for("s1").await, 2);
    }

    #[tokio::test]
    async fn test_result_from_other_address_ignored() {
        let c = DispatchCorrelator::new(&config(600, 5));
        c.on_dispatch("task_a", "connector", OriginContext::new("s1", "scan")).await.unwrap();
        assert!(c.on_result("attacker", &result("task_a")).await.is_none());
        assert_eq!(
            c.take("task_a", "attacker").await.unwrap_err(),
            CorrelationError::UnexpectedSender {
                task_id: "task_a".into(),
                from: "attacker".into(),
            }
        );
        assert_eq!(c.pending_len().await, 1);
        let (origin, _) = c.on_result("connector", &result("task_a")).await.unwrap();
        assert_eq!(origin.sender_id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_tombstones() {
        let c = DispatchCorrelator::new(&config(10, 5));
        c.on_dispatch("t1", "connector", OriginContext::new("s1", "a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(c.prune_expired().await, 1);
        assert_eq!(c.pending_len().await, 0);
        assert_eq!(
            c.take("t1", "connector").await.unwrap_err(),
            CorrelationError::Expired("t1".into())
        );
        assert_eq!(
            c.take("never", "connector").await.unwrap_err(),
            CorrelationError::UnknownTaskId("never".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_free_sender_slots() {
        let c = DispatchCorrelator::new(&config(10, 1));
        c.on_dispatch("t1", "connector", OriginContext::new("s1", "a")).await.unwrap();
        assert!(c.on_dispatch("t2", "connector", OriginContext::new("s1", "b")).await.is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(c.pending_count_for("s1").await, 0);
        c.on_dispatch("t2", "connector", OriginContext::new("s1", "b")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_loop_stops_on_cancel() {
        let c = Arc::new(DispatchCorrelator::new(&config(5, 5)));
        let token = CancellationToken::new();
        let handle = c.spawn_prune_loop(token.clone());
        c.on_dispatch("t1", "connector", OriginContext::new("s1", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(c.pending_len().await, 0);
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut t = Tombstones::default();
        for i in 0..10 {
            t.insert(format!("t{}", i), 4);
        }
        assert!(!t.contains("t0"));
        assert!(t.contains("t9"));
        assert_eq!(t.order.len(), 4);
    }
}
