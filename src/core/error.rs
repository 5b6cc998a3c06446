//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / RecordAndContinue / Abort。
//! 升级为致命错误时由 RunFailure 携带完整 Memory 轨迹，调用方无需重跑即可定位根因。

use std::fmt;

use thiserror::Error;

use crate::core::AgentState;
use crate::memory::Message;

/// 超时层级：单次工具调用 / 单步（该步全部调用）/ 整次 run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutScope {
    Tool,
    Step,
    Run,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Tool => write!(f, "tool"),
            TimeoutScope::Step => write!(f, "step"),
            TimeoutScope::Run => write!(f, "run"),
        }
    }
}

/// Agent 运行过程中可能出现的错误（工具、并发、超时、传输、配置等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Invalid parameters for '{tool}': {reason}")]
    InvalidParameters { tool: String, reason: String },

    #[error("Tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    /// 重入：Agent 正在 RUNNING 时再次调用 run
    #[error("Agent is busy")]
    Busy,

    #[error("Cancelled")]
    Cancelled,

    #[error("Timeout ({0})")]
    Timeout(TimeoutScope),

    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Agent already terminated in state {0:?}; call reset() first")]
    AlreadyTerminated(AgentState),

    #[error("Empty request")]
    EmptyRequest,

    #[error("Tool registration closed: agent is {0:?}")]
    RegistrationClosed(AgentState),

    #[error("Intent parse error: {0}")]
    IntentParse(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 工具层错误（记录到 Memory 后循环继续），非终止工具上不会升级
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            AgentError::ToolNotFound(_)
                | AgentError::InvalidParameters { .. }
                | AgentError::ToolExecution { .. }
                | AgentError::Timeout(TimeoutScope::Tool)
                | AgentError::TransportDisconnected(_)
        )
    }
}

/// 升级后的 run 失败：错误 + 已执行步数 + 截至失败点的完整 Memory 轨迹
#[derive(Error, Debug)]
#[error("{error} (after {steps} steps)")]
pub struct RunFailure {
    #[source]
    pub error: AgentError,
    pub steps: usize,
    pub trace: Vec<Message>,
}

impl RunFailure {
    pub fn new(error: AgentError, steps: usize, trace: Vec<Message>) -> Self {
        Self { error, steps, trace }
    }

    /// 未触碰 Memory 的快速失败（Busy / EmptyRequest / AlreadyTerminated）
    pub fn immediate(error: AgentError) -> Self {
        Self {
            error,
            steps: 0,
            trace: Vec::new(),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让策略重试（如意图 JSON 格式错误）
    RetryWithPrompt(String),
    /// 作为 tool 消息写入 Memory，循环继续
    RecordAndContinue,
    /// 终止当前 run，进入 ERROR
    Abort,
}
