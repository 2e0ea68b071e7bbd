//! 按请求方的滑动窗口限流

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// 窗口未满则记一次并返回 true；满了返回 false 且不记录
    pub async fn try_acquire(&self, requester: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let entries = hits.entry(requester.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= self.max_requests {
            return false;
        }
        entries.push_back(now);
        true
    }

    pub async fn count(&self, requester: &str) -> usize {
        let now = Instant::now();
        self.hits
            .lock()
            .await
            .get(requester)
            .map(|e| e.iter().filter(|t| now.duration_since(**t) < self.window).count())
            .unwrap_or(0)
    }
}
