//! 关键词规划器（离线、确定性）
//!
//! 扫描 / 报告 / 外发三类关键词各对应一个步骤模板，按此顺序拼成计划；都不命中时退化为 summarise_text。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{PlanOutcome, Planner};
use crate::protocol::{TaskConstraints, TaskPlan, TaskStep};

const DEMO_SCAN_PATH: &str = "./demo_projects";

fn scan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(scan|list|find|search|directory|repo|repos|project|projects)\b")
            .expect("valid regex")
    })
}

fn report_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(report|summary|summarise|summarize|digest|weekly|daily)\b")
            .expect("valid regex")
    })
}

fn post_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(post|send|publish|share|slack|email|notify)\b").expect("valid regex")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bemail\b").expect("valid regex"))
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct KeywordPlanner;

impl KeywordPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, objective: &str) -> PlanOutcome {
        let objective = objective.trim();
        if objective.is_empty() {
            return PlanOutcome::CannotPlan("empty objective".to_string());
        }

        let mut steps = Vec::new();
        if scan_re().is_match(objective) {
            steps.push(TaskStep::local(
                "scan_directory",
                params(json!({ "path": DEMO_SCAN_PATH })),
            ));
        }
        if report_re().is_match(objective) {
            steps.push(TaskStep::local(
                "generate_report",
                params(json!({ "format": "markdown" })),
            ));
        }
        if post_re().is_match(objective) {
            let target = if email_re().is_match(objective) { "email" } else { "slack" };
            steps.push(TaskStep::external(
                "post_summary",
                params(json!({ "target": target })),
            ));
        }
        if steps.is_empty() {
            steps.push(TaskStep::local(
                "summarise_text",
                params(json!({ "text": objective })),
            ));
        }

        let plan = TaskPlan::new(steps, TaskConstraints::default());
        tracing::info!(
            task_id = %plan.task_id,
            "Keyword-planned {} steps",
            plan.steps.len()
        );
        PlanOutcome::Plan(plan)
    }
}

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, objective: &str) -> PlanOutcome {
        self.build(objective)
    }
}
