//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKGATE__*` 覆盖（双下划线表示嵌套，如 `TASKGATE__LOCAL_POLICY__MAX_STEPS=5`）。
//! 所有字段都有默认值，空配置即可运行。

use std::path::PathBuf;

use serde::Deserialize;

use crate::policy::PolicyConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default = "PolicyConfig::remote_default")]
    pub remote_policy: PolicyConfig,
    #[serde(default = "PolicyConfig::local_default")]
    pub local_policy: PolicyConfig,
    #[serde(default)]
    pub correlator: CorrelatorSection,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            remote_policy: PolicyConfig::remote_default(),
            local_policy: PolicyConfig::local_default(),
            correlator: CorrelatorSection::default(),
            filter: FilterSection::default(),
            executor: ExecutorSection::default(),
            planner: PlannerSection::default(),
            orchestrator: OrchestratorSection::default(),
        }
    }
}

/// [app] 段：名称、密钥目录、演示用的 owner / device
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("./keys")
}

fn default_owner_id() -> String {
    "owner".to_string()
}

fn default_device_id() -> String {
    "device".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            key_dir: default_key_dir(),
            owner_id: default_owner_id(),
            device_id: default_device_id(),
        }
    }
}

/// [correlator] 段：待办下发的存活时间与每个发送方的上限
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CorrelatorSection {
    #[serde(default = "default_pending_ttl_seconds")]
    pub pending_ttl_seconds: u64,
    #[serde(default = "default_max_pending_per_sender")]
    pub max_pending_per_sender: usize,
    #[serde(default = "default_prune_interval_seconds")]
    pub prune_interval_seconds: u64,
    /// 记住多少个已过期的 task id，用于区分 Expired 与 UnknownTaskId
    #[serde(default = "default_tombstone_capacity")]
    pub tombstone_capacity: usize,
}

fn default_pending_ttl_seconds() -> u64 {
    600
}

fn default_max_pending_per_sender() -> usize {
    5
}

fn default_prune_interval_seconds() -> u64 {
    30
}

fn default_tombstone_capacity() -> usize {
    256
}

impl Default for CorrelatorSection {
    fn default() -> Self {
        Self {
            pending_ttl_seconds: default_pending_ttl_seconds(),
            max_pending_per_sender: default_max_pending_per_sender(),
            prune_interval_seconds: default_prune_interval_seconds(),
            tombstone_capacity: default_tombstone_capacity(),
        }
    }
}

/// [filter] 段：回声 / 重复过滤
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FilterSection {
    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: u64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_echo_emoji_threshold")]
    pub echo_emoji_threshold: usize,
    /// 追加的回声短语（小写子串匹配）
    #[serde(default)]
    pub extra_echo_patterns: Vec<String>,
    /// 没有任何目标关键词的文本视为回声
    #[serde(default = "default_true")]
    pub require_objective_keyword: bool,
}

fn default_dedup_window_seconds() -> u64 {
    120
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_echo_emoji_threshold() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            dedup_window_seconds: default_dedup_window_seconds(),
            cooldown_seconds: default_cooldown_seconds(),
            echo_emoji_threshold: default_echo_emoji_threshold(),
            extra_echo_patterns: Vec::new(),
            require_objective_keyword: true,
        }
    }
}

/// [executor] 段：单步超时、结果重放缓存时长
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExecutorSection {
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_replay_ttl_seconds")]
    pub replay_ttl_seconds: u64,
}

fn default_step_timeout_seconds() -> u64 {
    30
}

fn default_replay_ttl_seconds() -> u64 {
    3600
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout_seconds(),
            replay_ttl_seconds: default_replay_ttl_seconds(),
        }
    }
}

/// [planner] 段：keyword（离线）或 openai（兼容接口，失败回退到 keyword）
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlannerSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_planner_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_provider() -> String {
    "keyword".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_planner_timeout_seconds() -> u64 {
    30
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeout_seconds: default_planner_timeout_seconds(),
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OrchestratorSection {
    /// 策略 / 签名拒绝时是否回复发起方
    #[serde(default = "default_true")]
    pub reply_on_rejection: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            reply_on_rejection: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TASKGATE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKGATE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKGATE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("remote_policy.allowed_actions")
            .with_list_parse_key("local_policy.allowed_actions")
            .with_list_parse_key("remote_policy.allowed_path_prefixes")
            .with_list_parse_key("local_policy.allowed_path_prefixes")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
