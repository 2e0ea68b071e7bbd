//! 传输层抽象
//!
//! 协议只假设至少一次投递：消息可能延迟、乱序或重复。两方之间只通过消息交互。

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::WireMessage;

pub use memory::InMemoryTransport;

/// 带发送方地址的消息
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: String,
    pub message: WireMessage,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    #[error("Mailbox closed: {0}")]
    Closed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, from: &str, to: &str, message: WireMessage) -> Result<(), TransportError>;
}
