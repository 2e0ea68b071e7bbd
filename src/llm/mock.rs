//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复，用完后重复最后一条；也可模拟调用失败或卡住。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{LlmClient, Message};

#[derive(Debug)]
enum Behaviour {
    Replies(Mutex<Vec<String>>),
    Fail(String),
    Hang,
}

#[derive(Debug)]
pub struct MockLlmClient {
    behaviour: Behaviour,
}

impl MockLlmClient {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self::with_replies(vec![reply.into()])
    }

    pub fn with_replies(replies: Vec<String>) -> Self {
        Self {
            behaviour: Behaviour::Replies(Mutex::new(replies)),
        }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            behaviour: Behaviour::Fail(error.into()),
        }
    }

    /// 永不返回，用于测试规划超时
    pub fn hanging() -> Self {
        Self {
            behaviour: Behaviour::Hang,
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        match &self.behaviour {
            Behaviour::Replies(replies) => {
                let mut replies = replies.lock().map_err(|e| e.to_string())?;
                match replies.len() {
                    0 => Ok(String::new()),
                    1 => Ok(replies[0].clone()),
                    _ => Ok(replies.remove(0)),
                }
            }
            Behaviour::Fail(e) => Err(e.clone()),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err("mock hang elapsed".to_string())
            }
        }
    }
}
