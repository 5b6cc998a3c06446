//! Flow 类型定义
//!
//! 阶段定义、贯穿各阶段的有序上下文、阶段审计记录与 Flow 错误

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::AgentConfig;
use crate::core::{AgentError, FinishReason};
use crate::memory::Message;

/// 初始上下文中作为第一个阶段输入的键
pub const INITIAL_INPUT_KEY: &str = "input";

/// 一个阶段：由 AgentFactory 按此定义构建 Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// 阶段 Agent 的配置；未显式命名时使用阶段名
    #[serde(default, rename = "agent")]
    pub config: AgentConfig,
    /// 从上下文中带入的键（按声明顺序渲染为 `key: value` 行）
    #[serde(default)]
    pub inputs: Vec<String>,
    /// 输出写入上下文的键，默认阶段名
    #[serde(default)]
    pub output_key: Option<String>,
    /// 附加在输入前面的阶段指令
    #[serde(default)]
    pub instruction: Option<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, config: AgentConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inputs: Vec::new(),
            output_key: None,
            instruction: None,
        }
    }

    pub fn output_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.name)
    }

    /// 组装阶段输入：指令、上一阶段输出、声明的上下文键
    pub fn render_input(&self, previous: Option<&str>, ctx: &FlowContext) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(instruction) = self.instruction.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(instruction.to_string());
        }
        if let Some(prev) = previous.filter(|s| !s.trim().is_empty()) {
            parts.push(prev.to_string());
        }
        let lines: Vec<String> = self
            .inputs
            .iter()
            .filter_map(|key| ctx.get(key).map(|v| format!("{}: {}", key, render_value(v))))
            .collect();
        if !lines.is_empty() {
            parts.push(lines.join("\n"));
        }
        parts.join("\n\n")
    }
}

/// 字符串原样输出，其它 JSON 紧凑序列化
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 有序键值上下文；覆盖已有键时保留原位置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    entries: Vec<(String, Value)>,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以第一个阶段的输入初始化
    pub fn with_input(input: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(INITIAL_INPUT_KEY, Value::String(input.into()));
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// 字符串值的便捷读取
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for FlowContext {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}

/// 单个已完成阶段的审计记录
#[derive(Debug, Clone, Serialize)]
pub struct StageAudit {
    pub stage: String,
    pub index: usize,
    pub input: String,
    pub output: String,
    pub output_key: String,
    pub steps: usize,
    pub reason: FinishReason,
    pub trace: Vec<Message>,
    pub started_at: i64,
    pub finished_at: i64,
}

/// Flow 成功结束：最终上下文与逐阶段审计
#[derive(Debug, Clone, Serialize)]
pub struct FlowOutcome {
    pub context: FlowContext,
    pub audit: Vec<StageAudit>,
}

impl FlowOutcome {
    /// 最后一个阶段的输出
    pub fn final_output(&self) -> Option<&str> {
        self.audit.last().map(|a| a.output.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FlowError {
    /// 阶段进入 ERROR；后续阶段不再执行，audit 为此前已完成的阶段
    #[error("Stage '{stage}' (#{index}) failed: {error}")]
    StageFailed {
        stage: String,
        index: usize,
        #[source]
        error: AgentError,
        audit: Vec<StageAudit>,
        failed_trace: Vec<Message>,
    },

    #[error("Invalid flow definition: {0}")]
    InvalidDefinition(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_keeps_insertion_order() {
        let mut ctx = FlowContext::new();
        ctx.insert("b", json!(1));
        ctx.insert("a", json!("x"));
        ctx.insert("b", json!(2));
        assert_eq!(ctx.keys(), vec!["b", "a"]);
        assert_eq!(ctx.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_render_input() {
        let ctx: FlowContext = [("topic", json!("rust")), ("limit", json!(3))]
            .into_iter()
            .collect();
        let stage = StageSpec {
            inputs: vec!["limit".to_string(), "missing".to_string(), "topic".to_string()],
            instruction: Some("Summarize.".to_string()),
            ..StageSpec::new("summarize", AgentConfig::default())
        };
        assert_eq!(
            stage.render_input(Some("previous output"), &ctx),
            "Summarize.\n\nprevious output\n\nlimit: 3\ntopic: rust"
        );
        assert_eq!(stage.output_key(), "summarize");
    }
}
