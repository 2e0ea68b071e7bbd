//! taskgate - 安全任务下发协议与执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **dispatch**: 下发关联器与结果回复格式化
//! - **executor**: 动作注册表、顺序执行引擎、内置动作
//! - **filter**: 重复 / 回声过滤
//! - **identity**: 密钥、地址与配对注册表
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **node**: 规划端与执行端 actor
//! - **observability**: 日志初始化
//! - **planner**: 关键词规划器与 LLM 规划器
//! - **policy**: 动作 / 路径 / 步数 / 频率策略
//! - **protocol**: 计划、规范化编码、签名与线上消息
//! - **transport**: 传输抽象与进程内实现

pub mod config;
pub mod core;
pub mod dispatch;
pub mod executor;
pub mod filter;
pub mod identity;
pub mod llm;
pub mod node;
pub mod observability;
pub mod planner;
pub mod policy;
pub mod protocol;
pub mod transport;

pub use crate::core::error::{GateError, RejectReason};
