//! 回声 / 重复过滤
//!
//! 自然语言前端会把我们自己的回复改写后再发回来，形成反馈环。规划之前依次检查：
//! 1. 回声措辞（短语表、内嵌 task id、缺少目标关键词），以命令动词开头或带仓库链接的文本直接放行这一步
//! 2. 装饰符号（emoji）数量达到阈值
//! 3. 同一发送方冷却期内
//! 4. 同一发送方在去重窗口内发过相同内容（SHA-256）
//! 5. 发送方在途下发数已达上限
//!
//! 拒绝一律静默（只记日志）；放行时同时记录冷却时间戳与去重条目。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::FilterSection;
use crate::dispatch::DispatchCorrelator;

/// 我们自己回复里常见、用户真实请求里不会出现的措辞
const ECHO_PATTERNS: &[&str] = &[
    "task dispatched",
    "task executed",
    "execution complete",
    "standing by for results",
    "standing by for your",
    "standing by!",
    "awaiting exec",
    "awaiting result",
    "report generation dispatched",
    "report complete!",
    "report dispatched",
    "report generated!",
    "report delivered!",
    "report in flight",
    "mission accomplished",
    "mission complete!",
    "pipeline:",
    "pipeline running",
    "repos scanned",
    "scan_directory",
    "generate_report",
    "post_summary",
    "summarise_text",
    "clone_repo",
    "analyze_repo",
    "generate_health_report",
    "integration not configured",
    "summary ready for",
    "was rejected.",
    "no objective received",
    "no objective detected",
    "no task received",
    "what should i do next",
    "what do you want me to do",
    "ready when you are",
    "let's go!",
    "weekly report generated",
    "weekly dev report",
    "-step pipeline",
];

fn agent_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:@agent1[qpzry9x8gf2tvdw0s3jn54khce6mua7l]{59}\s*)+").expect("valid regex")
    })
}

fn command_verb_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(generate|analyze|analyse|review|audit|check|inspect|scan|clone|create|build|run|test|summarize|summarise|compare|look|give|get|show|find|list|tell|explain|help|what|how|can)\b",
        )
        .expect("valid regex")
    })
}

fn repo_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)https?://(github|gitlab)\.com/").expect("valid regex"))
}

fn task_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)task_[0-9a-f]{10,}").expect("valid regex"))
}

fn objective_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(generate|weekly|report|analyze|analyse|review|audit|health|score|check|inspect|github\.com|repo|repos|clone|scan|summarise|summarize|summary|post|send|list|find|project|projects|hello|hi|help|what|how|create|build|run|test|status)\b",
        )
        .expect("valid regex")
    })
}

/// emoji 及其修饰符（变体选择符、零宽连接符）
fn is_decorative(c: char) -> bool {
    matches!(
        c as u32,
        0x1F300..=0x1F9FF | 0x2600..=0x27BF | 0xFE00..=0xFE0F | 0x1FA00..=0x1FAFF | 0x200D
    )
}

pub fn emoji_count(text: &str) -> usize {
    text.chars().filter(|c| is_decorative(*c)).count()
}

/// 去掉前导的 `@agent1…` 提及与首尾空白
pub fn clean_objective(text: &str) -> String {
    agent_prefix_re().replace(text.trim(), "").trim().to_string()
}

/// 被拒原因，只用于日志与测试
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRejection {
    Empty,
    Echo(String),
    TooManyEmoji(usize),
    Cooldown,
    Duplicate,
    PendingLimit(usize),
}

impl std::fmt::Display for FilterRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterRejection::Empty => write!(f, "empty objective"),
            FilterRejection::Echo(why) => write!(f, "looks like an echo ({})", why),
            FilterRejection::TooManyEmoji(n) => write!(f, "{} decorative symbols", n),
            FilterRejection::Cooldown => write!(f, "sender in cooldown"),
            FilterRejection::Duplicate => write!(f, "duplicate within dedup window"),
            FilterRejection::PendingLimit(n) => write!(f, "{} dispatches already pending", n),
        }
    }
}

#[derive(Default)]
struct FilterState {
    last_admitted: HashMap<String, Instant>,
    /// (sender, content hash) → 最近一次放行时间
    seen: HashMap<(String, String), Instant>,
}

pub struct EchoFilter {
    config: FilterSection,
    extra_patterns: Vec<String>,
    correlator: Option<Arc<DispatchCorrelator>>,
    state: Mutex<FilterState>,
}

impl EchoFilter {
    pub fn new(config: FilterSection) -> Self {
        let extra_patterns = config
            .extra_echo_patterns
            .iter()
            .map(|p| p.to_lowercase())
            .collect();
        Self {
            config,
            extra_patterns,
            correlator: None,
            state: Mutex::new(FilterState::default()),
        }
    }

    /// 接入关联器后才检查在途上限（第 5 步）
    pub fn with_correlator(mut self, correlator: Arc<DispatchCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    /// 纯文本层面的回声判断（第 1 步）
    pub fn echo_reason(&self, cleaned: &str) -> Option<String> {
        if command_verb_re().is_match(cleaned) || repo_url_re().is_match(cleaned) {
            return None;
        }
        let lower = cleaned.to_lowercase();
        if let Some(p) = ECHO_PATTERNS
            .iter()
            .copied()
            .chain(self.extra_patterns.iter().map(String::as_str))
            .find(|p| lower.contains(p))
        {
            return Some(format!("phrase \"{}\"", p));
        }
        if task_id_re().is_match(cleaned) {
            return Some("embedded task id".to_string());
        }
        if self.config.require_objective_keyword && !objective_keyword_re().is_match(cleaned) {
            return Some("no objective keyword".to_string());
        }
        None
    }

    /// 逐步检查，放行时返回清理后的文本
    pub async fn screen(&self, sender_id: &str, text: &str) -> Result<String, FilterRejection> {
        let cleaned = clean_objective(text);
        if cleaned.is_empty() {
            return Err(FilterRejection::Empty);
        }
        if let Some(why) = self.echo_reason(&cleaned) {
            return Err(FilterRejection::Echo(why));
        }
        let emoji = emoji_count(&cleaned);
        if self.config.echo_emoji_threshold > 0 && emoji >= self.config.echo_emoji_threshold {
            return Err(FilterRejection::TooManyEmoji(emoji));
        }

        let hash = hex::encode(Sha256::digest(cleaned.to_lowercase().as_bytes()));
        let cooldown = Duration::from_secs(self.config.cooldown_seconds);
        let dedup_window = Duration::from_secs(self.config.dedup_window_seconds);
        let now = Instant::now();

        {
            let mut state = self.state.lock().await;
            state.seen.retain(|_, at| now.duration_since(*at) < dedup_window);
            state.last_admitted.retain(|_, at| now.duration_since(*at) < cooldown);

            if let Some(last) = state.last_admitted.get(sender_id) {
                if now.duration_since(*last) < cooldown {
                    return Err(FilterRejection::Cooldown);
                }
            }
            if state.seen.contains_key(&(sender_id.to_string(), hash.clone())) {
                return Err(FilterRejection::Duplicate);
            }
        }

        if let Some(correlator) = &self.correlator {
            let pending = correlator.pending_count_for(sender_id).await;
            if pending >= correlator.max_pending_per_sender() {
                return Err(FilterRejection::PendingLimit(pending));
            }
        }

        // 两次加锁之间可能有同一发送方的并发请求先被放行
        let mut state = self.state.lock().await;
        if state.last_admitted.get(sender_id).is_some_and(|last| now.duration_since(*last) < cooldown) {
            return Err(FilterRejection::Cooldown);
        }
        if state.seen.contains_key(&(sender_id.to_string(), hash.clone())) {
            return Err(FilterRejection::Duplicate);
        }
        state.last_admitted.insert(sender_id.to_string(), now);
        state.seen.insert((sender_id.to_string(), hash), now);
        Ok(cleaned)
    }

    #[cfg(test)]
    async fn tracked_senders(&self) -> usize {
        self.state.lock().await.last_admitted.len()
    }

    pub async fn admit(&self, sender_id: &str, text: &str) -> bool {
        match self.screen(sender_id, text).await {
            Ok(_) => true,
            Err(reason) => {
                tracing::warn!(sender = %sender_id, "Objective dropped: {}", reason);
                false
            }
        }
    }
}
