//! LLM 规划器：把 Memory 交给 LLM，解析回复为意图
//!
//! 期望 LLM 输出 `{"thought": "...", "tool_calls": [{"tool": "...", "args": {...}}]}`；
//! 也接受旧的单调用格式 `{"tool": "...", "args": {...}}`。不含 JSON 的纯文本视为最终回复。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::strategy::{Intent, IntentContext, IntentStrategy};
use crate::tools::{intent_schema_json, ToolInvocation};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous agent. Work step by step: think about the request, \
call tools to make progress, and read their observations before the next step. \
When the request is fully handled, call the `finish` tool with the final answer.";

#[derive(Debug, Deserialize)]
struct RawIntent {
    thought: Option<String>,
    tool_calls: Option<Vec<RawCall>>,
    tool: Option<String>,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct RawCall {
    #[serde(alias = "name")]
    tool: String,
    #[serde(default, alias = "arguments")]
    args: Value,
    #[serde(default)]
    depends_on_previous: bool,
}

/// 从文本中提取 JSON 块（```json ... ``` 或首个 { 到末个 }）
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析 LLM 输出为意图；JSON 语法或结构错误返回 IntentParse，由恢复引擎决定是否重试
pub fn parse_llm_output(output: &str) -> Result<Intent, AgentError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(AgentError::IntentParse("empty model output".to_string()));
    }
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Intent::Complete(trimmed.to_string()));
    };

    let raw: RawIntent = serde_json::from_str(json_str)
        .map_err(|e| AgentError::IntentParse(format!("{}: {}", e, json_str)))?;

    let thought = raw.thought.filter(|t| !t.trim().is_empty());
    let calls: Vec<ToolInvocation> = match (raw.tool_calls, raw.tool) {
        (Some(calls), _) => calls
            .into_iter()
            .map(|c| ToolInvocation {
                depends_on_previous: c.depends_on_previous,
                ..ToolInvocation::new(c.tool, c.args)
            })
            .collect(),
        (None, Some(tool)) if !tool.is_empty() => vec![ToolInvocation::new(tool, raw.args)],
        _ => Vec::new(),
    };

    if let Some(bad) = calls.iter().find(|c| c.tool.trim().is_empty()) {
        return Err(AgentError::IntentParse(format!(
            "tool call {} has an empty tool name",
            bad.id
        )));
    }
    if calls.is_empty() {
        return match thought {
            Some(t) => Ok(Intent::Complete(t)),
            None => Err(AgentError::IntentParse(format!(
                "no tool_calls and no thought: {}",
                json_str
            ))),
        };
    }
    Ok(Intent::Act { thought, calls })
}

/// LLM 规划器：持有 LLM 与基础 system prompt；每步动态拼接工具清单
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    request_timeout: Duration,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: Option<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn compose_system(&self, ctx: &IntentContext<'_>) -> String {
        format!(
            "{}\n\nStep {} of {}.\n\nAvailable tools:\n{}\n\nReply with exactly one JSON object matching this schema:\n{}",
            self.system_prompt,
            ctx.step,
            ctx.max_steps,
            ctx.tools.to_schema_json(),
            intent_schema_json()
        )
    }
}

#[async_trait]
impl IntentStrategy for LlmPlanner {
    async fn derive(&self, ctx: &IntentContext<'_>) -> Result<Intent, AgentError> {
        let mut messages = Vec::with_capacity(ctx.memory.len() + 1);
        messages.push(Message::system(self.compose_system(ctx)));
        messages.extend(ctx.memory.iter().cloned());

        let output = tokio::time::timeout(self.request_timeout, self.llm.complete(&messages))
            .await
            .map_err(|_| AgentError::Llm(format!("request timed out after {:?}", self.request_timeout)))?
            .map_err(AgentError::Llm)?;
        tracing::debug!(step = ctx.step, output = %output, "planner output");
        parse_llm_output(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::ToolCollection;
    use serde_json::json;

    #[test]
    fn test_parse_multi_call() {
        let intent = parse_llm_output(
            r#"{"thought": "look around", "tool_calls": [
                {"tool": "shell", "args": {"command": "ls"}},
                {"tool": "echo", "args": {"text": "x"}, "depends_on_previous": true}
            ]}"#,
        )
        .unwrap();
        match intent {
            Intent::Act { thought, calls } => {
                assert_eq!(thought.as_deref(), Some("look around"));
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].tool, "shell");
                assert!(!calls[0].depends_on_previous);
                assert!(calls[1].depends_on_previous);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_legacy_single_call_in_fence() {
        let intent = parse_llm_output(
            "Sure.\n```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"hi\"}}\n```",
        )
        .unwrap();
        match intent {
            Intent::Act { calls, .. } => {
                assert_eq!(calls[0].tool, "echo");
                assert_eq!(calls[0].args, json!({"text": "hi"}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_is_completion() {
        assert_eq!(
            parse_llm_output("  The answer is 42.  ").unwrap(),
            Intent::Complete("The answer is 42.".to_string())
        );
    }

    #[test]
    fn test_broken_json_is_parse_error() {
        let err = parse_llm_output(r#"{"tool_calls": [{"tool": "echo",}]}"#).unwrap_err();
        assert!(matches!(err, AgentError::IntentParse(_)));
        let err = parse_llm_output("").unwrap_err();
        assert!(matches!(err, AgentError::IntentParse(_)));
    }

    #[tokio::test]
    async fn test_planner_with_mock_llm() {
        let llm = Arc::new(MockLlmClient::new());
        let planner = LlmPlanner::new(llm.clone(), None);
        let memory = vec![Message::user("ping")];
        let tools = ToolCollection::new();
        let ctx = IntentContext {
            memory: &memory,
            tools: &tools,
            step: 1,
            max_steps: 3,
        };
        match planner.derive(&ctx).await.unwrap() {
            Intent::Act { calls, .. } => {
                assert_eq!(calls[0].tool, "finish");
                assert_eq!(calls[0].args["output"], "Echo from Mock: ping");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(llm.calls(), 1);
    }
}
