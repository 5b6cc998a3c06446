//! Agent 过程事件：用于 CLI / 日志展示思考、工具调用、观察与结束原因

use serde::Serialize;

use crate::core::FinishReason;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 步数更新（当前第几步）
    StepUpdate {
        agent: String,
        step: usize,
        max_steps: usize,
    },
    /// 策略给出的思考内容
    Thinking { text: String },
    /// 调用工具
    ToolCall {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 工具执行失败（已记录到 Memory）
    ToolFailure { tool: String, reason: String },
    /// 恢复动作（RetryWithPrompt / 换策略提示等）
    Recovery { action: String, detail: String },
    /// 远程工具集合变化
    RemoteToolsChanged {
        server: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
    Finished { output: String, reason: FinishReason },
    Error { text: String },
}
