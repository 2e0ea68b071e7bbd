//! 规划器：自然语言目标 → 任务计划
//!
//! 协议不关心计划从哪来；规划器要么给出合法计划，要么明确表示无法规划。

pub mod keyword;
pub mod llm;

use async_trait::async_trait;

use crate::protocol::TaskPlan;

pub use keyword::KeywordPlanner;
pub use llm::{parse_plan_output, LlmPlanner};

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Plan(TaskPlan),
    CannotPlan(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, objective: &str) -> PlanOutcome;
}
