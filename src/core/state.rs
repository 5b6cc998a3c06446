//! 状态定义：AgentState 状态机与 AgentStatus 投影
//!
//! 迁移规则：IDLE -> RUNNING（run）；RUNNING -> RUNNING（每步）；RUNNING -> FINISHED / ERROR；
//! FINISHED、ERROR 为终态，只能经 reset 显式回到 IDLE。

use serde::Serialize;

/// Agent 状态（同一时刻只持有一个）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Finished,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Finished | AgentState::Error)
    }

    /// 受保护的迁移表；reset（终态 -> IDLE）单独处理，不在此表内
    pub fn can_transition(self, to: AgentState) -> bool {
        matches!(
            (self, to),
            (AgentState::Idle, AgentState::Running)
                | (AgentState::Running, AgentState::Running)
                | (AgentState::Running, AgentState::Finished)
                | (AgentState::Running, AgentState::Error)
        )
    }
}

/// run 正常结束（FINISHED）的原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FinishReason {
    /// 某工具返回 is_terminal（如 finish）
    TerminalTool(String),
    /// 步数预算耗尽（不是错误）
    StepBudgetExhausted,
    /// 策略直接给出最终回复
    Completed,
}

/// 对外可见的轻量状态快照（供 CLI / 日志展示）
#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub state: AgentState,
    pub steps: usize,
    pub memory_len: usize,
    pub tools: Vec<String>,
    pub last_error: Option<String>,
}
