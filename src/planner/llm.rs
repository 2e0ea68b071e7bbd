//! LLM 规划器
//!
//! 调用 OpenAI 兼容模型产出 JSON 计划；调用失败、超时、解析失败或零步骤时回退到关键词规划器。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::keyword::KeywordPlanner;
use super::{PlanOutcome, Planner};
use crate::llm::{LlmClient, Message};
use crate::protocol::{StepKind, TaskConstraints, TaskPlan, TaskStep};

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(alias = "type", default = "default_kind")]
    kind: StepKind,
    action: String,
    #[serde(default)]
    params: Map<String, Value>,
}

fn default_kind() -> StepKind {
    StepKind::Local
}

#[derive(Debug, Default, Deserialize)]
struct RawConstraints {
    max_steps: Option<usize>,
    #[serde(alias = "require_user_confirmation")]
    require_confirmation: Option<bool>,
    #[serde(alias = "no_delete")]
    no_destructive: Option<bool>,
    max_duration_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    constraints: RawConstraints,
}

/// 从模型输出里取出步骤与约束：兼容 ```json 代码块、前后有闲聊文字的情况
pub fn parse_plan_output(output: &str) -> Result<(Vec<TaskStep>, TaskConstraints), String> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Err(format!("no JSON object in output: {}", trimmed));
        }
    } else {
        return Err(format!("no JSON object in output: {}", trimmed));
    };

    let raw: RawPlan =
        serde_json::from_str(json_str).map_err(|e| format!("{}: {}", e, json_str))?;
    let steps = raw
        .steps
        .into_iter()
        .map(|s| TaskStep {
            kind: s.kind,
            action: s.action,
            params: s.params,
        })
        .collect();

    let defaults = TaskConstraints::default();
    let constraints = TaskConstraints {
        max_steps: raw.constraints.max_steps,
        require_confirmation: raw
            .constraints
            .require_confirmation
            .unwrap_or(defaults.require_confirmation),
        no_destructive: raw.constraints.no_destructive.unwrap_or(defaults.no_destructive),
        max_duration_seconds: raw
            .constraints
            .max_duration_seconds
            .unwrap_or(defaults.max_duration_seconds),
    };
    Ok((steps, constraints))
}

fn system_prompt(actions: &[(String, String)]) -> String {
    let mut prompt = String::from(
        "You are a task planner. Given a user objective, reply with ONLY a JSON object:\n\
         {\"steps\": [{\"kind\": \"local\" | \"external\", \"action\": \"<action>\", \"params\": {...}}],\n\
          \"constraints\": {\"no_destructive\": true, \"require_confirmation\": false}}\n\n\
         Available actions:\n",
    );
    for (name, description) in actions {
        prompt.push_str(&format!("  - {}: {}\n", name, description));
    }
    prompt.push_str(
        "\nRules:\n\
         - Use \"external\" only for sending or posting, \"local\" otherwise.\n\
         - Always use \"./demo_projects\" as the path for scan_directory.\n\
         - No explanation, no markdown.\n",
    );
    prompt
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    fallback: KeywordPlanner,
    system_prompt: String,
    timeout: Duration,
}

impl LlmPlanner {
    /// `actions` 为 (动作名, 描述)，写进系统提示词
    pub fn new(llm: Arc<dyn LlmClient>, actions: &[(String, String)], timeout_secs: u64) -> Self {
        Self {
            llm,
            fallback: KeywordPlanner::new(),
            system_prompt: system_prompt(actions),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    async fn plan_with_llm(&self, objective: &str) -> Result<TaskPlan, String> {
        let messages = [
            Message::system(self.system_prompt.clone()),
            Message::user(objective),
        ];
        let output = tokio::time::timeout(self.timeout, self.llm.complete(&messages))
            .await
            .map_err(|_| format!("LLM timed out after {:?}", self.timeout))??;
        let (steps, constraints) = parse_plan_output(&output)?;
        if steps.is_empty() {
            return Err("LLM returned zero steps".to_string());
        }
        Ok(TaskPlan::new(steps, constraints))
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, objective: &str) -> PlanOutcome {
        if objective.trim().is_empty() {
            return PlanOutcome::CannotPlan("empty objective".to_string());
        }
        match self.plan_with_llm(objective).await {
            Ok(plan) => {
                let (prompt, completion, total) = self.llm.token_usage();
                tracing::info!(
                    task_id = %plan.task_id,
                    prompt_tokens = prompt,
                    completion_tokens = completion,
                    total_tokens = total,
                    "LLM planned {} steps",
                    plan.steps.len()
                );
                PlanOutcome::Plan(plan)
            }
            Err(e) => {
                tracing::warn!("LLM planning failed: {}; falling back to keywords", e);
                self.fallback.build(objective)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn planner(mock: MockLlmClient) -> LlmPlanner {
        let actions = vec![("summarise_text".to_string(), "Summarise text".to_string())];
        LlmPlanner::new(Arc::new(mock), &actions, 5)
    }

    #[test]
    fn test_parse_fenced_output_with_aliases() {
        let out = "Sure!\n```json\n{\"steps\":[{\"type\":\"external\",\"action\":\"post_summary\",\"params\":{\"target\":\"email\"}}],\"constraints\":{\"no_delete\":false}}\n```";
        let (steps, constraints) = parse_plan_output(out).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::External);
        assert_eq!(steps[0].params["target"], json!("email"));
        assert!(!constraints.no_destructive);
        assert_eq!(constraints.max_duration_seconds, 300);
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_plan_output("I cannot help with that").is_err());
    }

    #[tokio::test]
    async fn test_llm_plan_used() {
        let p = planner(MockLlmClient::with_reply(
            r#"{"steps":[{"kind":"local","action":"summarise_text","params":{"text":"hi"}}]}"#,
        ));
        match p.plan("summarise hi").await {
            PlanOutcome::Plan(plan) => {
                assert_eq!(plan.steps.len(), 1);
                assert_eq!(plan.steps[0].action, "summarise_text");
                assert!(plan.task_id.starts_with("task_"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_falls_back_on_error_and_empty() {
        let p = planner(MockLlmClient::failing("503"));
        match p.plan("scan my projects").await {
            PlanOutcome::Plan(plan) => assert_eq!(plan.steps[0].action, "scan_directory"),
            other => panic!("unexpected {:?}", other),
        }

        let p = planner(MockLlmClient::with_reply(r#"{"steps": []}"#));
        assert!(matches!(p.plan("hello").await, PlanOutcome::Plan(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_on_timeout() {
        let p = planner(MockLlmClient::hanging());
        match p.plan("weekly report").await {
            PlanOutcome::Plan(plan) => assert_eq!(plan.steps[0].action, "generate_report"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blank_cannot_plan() {
        let p = planner(MockLlmClient::with_reply("{}"));
        assert!(matches!(p.plan("  ").await, PlanOutcome::CannotPlan(_)));
    }
}
