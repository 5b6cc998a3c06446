//! 工具集合
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolCollection
//! 按名注册与查找；名称唯一，重复注册默认报 DuplicateTool，显式 override 时覆盖并告警。
//! dispatch 前按 schema 校验参数，工具自身的失败包进 ToolResult.error，不会破坏 Agent 循环。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::schema::validate_args;

/// 工具执行结果：输出（文本或结构化）、可选错误、是否结束 Agent 循环
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_terminal: bool,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: Value::String(output.into()),
            error: None,
            is_terminal: false,
        }
    }

    pub fn json(output: Value) -> Self {
        Self {
            output,
            error: None,
            is_terminal: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            error: Some(error.into()),
            is_terminal: false,
        }
    }

    /// 终止型结果（如 finish 工具）
    pub fn terminal(output: impl Into<String>) -> Self {
        Self {
            is_terminal: true,
            ..Self::text(output)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 输出转文本：字符串原样返回，其它 JSON 紧凑序列化
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// 写入 Memory 的内容
    pub fn to_observation(&self) -> String {
        match &self.error {
            Some(e) => format!("Error: {}", e),
            None => self.output_text(),
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（ToolCollection 内唯一）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 工具当前是否可用；远程代理工具在会话断开后返回 false
    fn is_available(&self) -> bool {
        true
    }

    /// 来源标识：远程代理工具返回其 MCP Session id，本地工具为 None
    fn origin(&self) -> Option<&str> {
        None
    }

    /// 执行工具；Err 表示工具自身失败，由 ToolCollection 包进 ToolResult.error
    async fn execute(&self, args: Value) -> Result<ToolResult, String>;
}

/// 工具集合：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolCollection {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCollection")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名已存在时返回 DuplicateTool
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_with(Arc::new(tool), false)
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        self.register_with(tool, false)
    }

    /// allow_override 为 true 时覆盖同名工具并输出告警
    pub fn register_with(
        &mut self,
        tool: Arc<dyn Tool>,
        allow_override: bool,
    ) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            if !allow_override {
                return Err(AgentError::DuplicateTool(name));
            }
            tracing::warn!(tool = %name, "tool overridden by later registration");
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// 合并另一集合：后注册者覆盖先注册者（同名告警）
    pub fn merge(&mut self, other: ToolCollection) {
        for (_, tool) in other.tools {
            // allow_override=true 不会失败
            let _ = self.register_with(tool, true);
        }
    }

    /// 查找可用工具；存在但不可用（如会话已断开）视同不存在
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .filter(|t| t.is_available())
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    /// 移除来源为 origin 的全部工具，返回被移除的名称（已排序）
    pub fn unregister_origin(&mut self, origin: &str) -> Vec<String> {
        let mut removed: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, t)| t.origin() == Some(origin))
            .map(|(n, _)| n.clone())
            .collect();
        removed.sort();
        for name in &removed {
            self.tools.remove(name);
        }
        removed
    }

    /// 清理不可用的工具（如断开会话的代理），返回被移除的名称
    pub fn sweep_unavailable(&mut self) -> Vec<String> {
        let mut removed: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, t)| !t.is_available())
            .map(|(n, _)| n.clone())
            .collect();
        removed.sort();
        for name in &removed {
            self.tools.remove(name);
            tracing::warn!(tool = %name, "unavailable tool removed from collection");
        }
        removed
    }

    /// 只保留 keep 返回 true 的工具
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.tools.retain(|name, _| keep(name));
    }

    /// 已注册工具名（按字母序，保证 prompt 与日志稳定）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称排序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Tool>)> {
        let mut entries: Vec<(&str, &Arc<dyn Tool>)> =
            self.tools.iter().map(|(n, t)| (n.as_str(), t)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 动态生成工具 schema JSON（供 prompt 中的 Available tools 段落）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .iter()
            .filter(|(_, t)| t.is_available())
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 按名调度：未找到 -> ToolNotFound；参数不符 schema -> InvalidParameters；
    /// 工具执行失败包进 ToolResult.error
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<ToolResult, AgentError> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        validate_args(&tool.parameters_schema(), &args).map_err(|reason| {
            AgentError::InvalidParameters {
                tool: name.to_string(),
                reason,
            }
        })?;
        match tool.execute(args).await {
            Ok(result) => Ok(result),
            Err(e) => Ok(ToolResult::failure(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            self.1
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::text(self.1))
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Err("disk on fire".to_string())
        }
    }

    struct Flaky {
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "remote_echo"
        }
        fn description(&self) -> &str {
            "remote"
        }
        fn is_available(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn origin(&self) -> Option<&str> {
            Some("session-1")
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::text("pong"))
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut tools = ToolCollection::new();
        tools.register(Named("echo", "first")).unwrap();
        let err = tools.register(Named("echo", "second")).unwrap_err();
        assert_eq!(err, AgentError::DuplicateTool("echo".to_string()));
        assert_eq!(tools.get("echo").unwrap().description(), "first");
    }

    #[test]
    fn test_override_replaces() {
        let mut tools = ToolCollection::new();
        tools.register(Named("echo", "first")).unwrap();
        tools
            .register_with(Arc::new(Named("echo", "second")), true)
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools.get("echo").unwrap().description(), "second");
    }

    #[test]
    fn test_merge_later_wins() {
        let mut a = ToolCollection::new();
        a.register(Named("echo", "a")).unwrap();
        a.register(Named("only_a", "a")).unwrap();
        let mut b = ToolCollection::new();
        b.register(Named("echo", "b")).unwrap();
        a.merge(b);
        assert_eq!(a.names(), vec!["echo".to_string(), "only_a".to_string()]);
        assert_eq!(a.get("echo").unwrap().description(), "b");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let tools = ToolCollection::new();
        let err = tools.dispatch("nope", Value::Null).await.unwrap_err();
        assert_eq!(err, AgentError::ToolNotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_wraps_execution_error() {
        let mut tools = ToolCollection::new();
        tools.register(Failing).unwrap();
        let result = tools.dispatch("failing", serde_json::json!({})).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("disk on fire"));
        assert_eq!(result.to_observation(), "Error: disk on fire");
    }

    #[tokio::test]
    async fn test_unavailable_tool_is_not_found_and_swept() {
        let alive = Arc::new(AtomicBool::new(true));
        let mut tools = ToolCollection::new();
        tools
            .register(Flaky {
                alive: alive.clone(),
            })
            .unwrap();
        assert!(tools.dispatch("remote_echo", Value::Null).await.is_ok());

        alive.store(false, Ordering::SeqCst);
        let err = tools.dispatch("remote_echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(_)));
        assert_eq!(tools.sweep_unavailable(), vec!["remote_echo".to_string()]);
        assert!(tools.is_empty());
    }

    #[test]
    fn test_unregister_origin() {
        let mut tools = ToolCollection::new();
        tools.register(Named("local", "x")).unwrap();
        tools
            .register(Flaky {
                alive: Arc::new(AtomicBool::new(true)),
            })
            .unwrap();
        assert_eq!(
            tools.unregister_origin("session-1"),
            vec!["remote_echo".to_string()]
        );
        assert_eq!(tools.names(), vec!["local".to_string()]);
    }

    #[test]
    fn test_schema_json_lists_tools_sorted() {
        let mut tools = ToolCollection::new();
        tools.register(Named("zeta", "z")).unwrap();
        tools.register(Named("alpha", "a")).unwrap();
        let json: Value = serde_json::from_str(&tools.to_schema_json()).unwrap();
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
