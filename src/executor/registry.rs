//! 动作注册表
//!
//! 所有动作实现 ActionHandler（name / description / handle），由 ActionRegistry 按名注册与查找。
//! 处理函数只拿到本步参数与上一步输出，不接触任何协议状态。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// 单步输出：字符串键到 JSON 值
pub type ActionOutput = Map<String, Value>;

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// 动作名（计划里 step.action 的取值）
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// `previous_output` 为上一步的输出，第一步为空表
    async fn handle(
        &self,
        params: Map<String, Value>,
        previous_output: ActionOutput,
    ) -> Result<ActionOutput, String>;
}

/// 动作注册表：按名称存储 Arc<dyn ActionHandler>
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// (name, description) 列表，供 LLM 规划提示词使用
    pub fn action_descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .handlers
            .iter()
            .map(|(name, h)| (name.clone(), h.description().to_string()))
            .collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl ActionHandler for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn handle(
            &self,
            params: Map<String, Value>,
            _previous_output: ActionOutput,
        ) -> Result<ActionOutput, String> {
            let text = params
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or("missing text")?;
            let mut out = Map::new();
            out.insert("text".into(), Value::String(text.to_uppercase()));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = ActionRegistry::new();
        registry.register(Upper);
        assert!(registry.contains("upper"));
        assert_eq!(registry.action_names(), vec!["upper".to_string()]);

        let handler = registry.get("upper").unwrap();
        let mut params = Map::new();
        params.insert("text".into(), Value::String("abc".into()));
        let out = handler.handle(params, Map::new()).await.unwrap();
        assert_eq!(out["text"], Value::String("ABC".into()));

        assert!(registry.get("nope").is_none());
    }
}
