//! 进程内传输：地址 → mpsc 邮箱
//!
//! 测试与演示程序用；可打开重复投递来模拟至少一次语义。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::{Envelope, Transport, TransportError};
use crate::protocol::WireMessage;

#[derive(Default)]
pub struct InMemoryTransport {
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    duplicate_deliveries: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册地址并拿到它的收件箱；重复注册会替换旧邮箱
    pub async fn register(&self, address: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().await.insert(address.to_string(), tx);
        rx
    }

    /// 打开后每条消息投递两次
    pub fn set_duplicate_deliveries(&self, enabled: bool) {
        self.duplicate_deliveries.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, from: &str, to: &str, message: WireMessage) -> Result<(), TransportError> {
        let tx = self
            .mailboxes
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownAddress(to.to_string()))?;

        tracing::debug!(from = %from, to = %to, kind = message.kind(), "send");
        let envelope = Envelope {
            from: from.to_string(),
            message,
        };
        if self.duplicate_deliveries.load(Ordering::SeqCst) {
            tx.send(envelope.clone())
                .map_err(|_| TransportError::Closed(to.to_string()))?;
        }
        tx.send(envelope)
            .map_err(|_| TransportError::Closed(to.to_string()))
    }
}
