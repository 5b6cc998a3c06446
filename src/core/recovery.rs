//! 错误恢复引擎
//!
//! 根据 AgentError 类型与是否发生在终止工具上返回 RecoveryAction，
//! 供 Agent 步循环决定是重试、记录后继续还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// on_terminal_tool：错误是否发生在指定的终止工具（如 finish）上
    pub fn handle(&self, err: &AgentError, on_terminal_tool: bool) -> RecoveryAction {
        if on_terminal_tool {
            return RecoveryAction::Abort;
        }
        match err {
            AgentError::IntentParse(raw) => RecoveryAction::RetryWithPrompt(format!(
                "上一轮输出无法解析为工具调用: {raw}。\
                调用工具时只输出一个合法 JSON 对象，格式为: \
                {{\"thought\": \"...\", \"tool_calls\": [{{\"tool\": \"工具名\", \"args\": {{...}}}}]}}。\
                若任务已完成，请调用 finish 工具。"
            )),
            e if e.is_tool_level() => RecoveryAction::RecordAndContinue,
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TimeoutScope;

    #[test]
    fn test_recovery_intent_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::IntentParse("invalid json".to_string());
        match engine.handle(&err, false) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_tool_not_found_continues() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolNotFound("fake_tool".to_string());
        assert_eq!(engine.handle(&err, false), RecoveryAction::RecordAndContinue);
    }

    #[test]
    fn test_recovery_terminal_tool_escalates() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolNotFound("finish".to_string());
        assert_eq!(engine.handle(&err, true), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_tool_timeout_continues() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Timeout(TimeoutScope::Tool);
        assert_eq!(engine.handle(&err, false), RecoveryAction::RecordAndContinue);
    }

    #[test]
    fn test_recovery_step_timeout_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Timeout(TimeoutScope::Step);
        assert_eq!(engine.handle(&err, false), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_llm_error_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm("rate limited".to_string());
        assert_eq!(engine.handle(&err, false), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&AgentError::Cancelled, false), RecoveryAction::Abort);
    }
}
