//! 策略配置：动作白名单、路径前缀、步数上限、滑动窗口限流
//!
//! 每一方加载一次、之后只读。字段缺省值取本地（执行端）那套较保守的默认值，
//! 整段缺省时规划端用 [`PolicyConfig::remote_default`]。

use std::path::PathBuf;

use serde::Deserialize;

/// 规划端默认允许的七个工作流动作
pub const REMOTE_DEFAULT_ACTIONS: [&str; 7] = [
    "scan_directory",
    "generate_report",
    "summarise_text",
    "post_summary",
    "clone_repo",
    "analyze_repo",
    "generate_health_report",
];

/// 执行端默认只开放周报相关的四个动作
pub const LOCAL_DEFAULT_ACTIONS: [&str; 4] = [
    "scan_directory",
    "generate_report",
    "summarise_text",
    "post_summary",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

fn default_window_seconds() -> u64 {
    60
}

fn default_max_requests() -> usize {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_requests: default_max_requests(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_local_actions")]
    pub allowed_actions: Vec<String>,
    /// 空列表表示不放行任何路径类参数
    #[serde(default = "default_path_prefixes")]
    pub allowed_path_prefixes: Vec<String>,
    #[serde(default = "default_local_max_steps")]
    pub max_steps: usize,
    /// 相对路径的基准目录，未设置时用进程当前目录
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_local_actions() -> Vec<String> {
    LOCAL_DEFAULT_ACTIONS.iter().map(|s| s.to_string()).collect()
}

fn default_path_prefixes() -> Vec<String> {
    vec![
        "~/projects".into(),
        "~/Documents".into(),
        "/tmp".into(),
        "./demo_projects".into(),
        ".".into(),
    ]
}

fn default_local_max_steps() -> usize {
    10
}

impl PolicyConfig {
    pub fn remote_default() -> Self {
        Self {
            allowed_actions: REMOTE_DEFAULT_ACTIONS.iter().map(|s| s.to_string()).collect(),
            allowed_path_prefixes: default_path_prefixes(),
            max_steps: 20,
            base_dir: None,
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn local_default() -> Self {
        Self {
            allowed_actions: default_local_actions(),
            allowed_path_prefixes: default_path_prefixes(),
            max_steps: default_local_max_steps(),
            base_dir: None,
            rate_limit: RateLimitConfig {
                window_seconds: 60,
                max_requests: 30,
            },
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::local_default()
    }
}
