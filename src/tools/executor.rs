//! 工具执行器
//!
//! 对每次调用施加超时并输出结构化审计日志（JSON）；同一步内的多个调用按批并发执行，
//! 结果按原始请求顺序重新拼接，保证 Memory 追加顺序与完成先后无关。

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, TaskScheduler, TimeoutScope};
use crate::tools::{ToolCollection, ToolResult};

/// 一次工具调用请求：{tool_name, params}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(default = "new_call_id")]
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    /// 为 true 时必须等前面的调用全部完成后再执行（开启新的顺序批次）
    #[serde(default)]
    pub depends_on_previous: bool,
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: new_call_id(),
            tool: tool.into(),
            args,
            depends_on_previous: false,
        }
    }

    /// 声明对前一个调用的顺序依赖
    pub fn after_previous(mut self) -> Self {
        self.depends_on_previous = true;
        self
    }
}

/// 单次调用的结果：ToolResult 总是存在；failure 记录失败的错误分类（用于终止工具升级判断）
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub invocation: ToolInvocation,
    pub result: ToolResult,
    pub failure: Option<AgentError>,
    pub duration: Duration,
}

impl ToolOutcome {
    pub fn is_terminal(&self) -> bool {
        self.failure.is_none() && self.result.is_terminal
    }
}

/// 工具执行器：对每次调用施加超时，并限制同一时刻的并发数
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(timeout: Duration, scheduler: TaskScheduler) -> Self {
        Self { timeout, scheduler }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行单个调用；未知工具立即返回（不占并发许可，不会阻塞）
    pub async fn execute(&self, tools: &ToolCollection, invocation: ToolInvocation) -> ToolOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&invocation.args);

        let outcome: Result<ToolResult, AgentError> = if !tools.contains(&invocation.tool) {
            Err(AgentError::ToolNotFound(invocation.tool.clone()))
        } else {
            match self.scheduler.acquire_tool().await {
                Ok(_permit) => {
                    match timeout(self.timeout, tools.dispatch(&invocation.tool, invocation.args.clone()))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(AgentError::Timeout(TimeoutScope::Tool)),
                    }
                }
                Err(e) => Err(e),
            }
        };

        let outcome_label = match &outcome {
            Ok(r) if r.is_error() => "error",
            Ok(_) => "ok",
            Err(AgentError::ToolNotFound(_)) => "not_found",
            Err(AgentError::InvalidParameters { .. }) => "invalid_parameters",
            Err(AgentError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let duration = start.elapsed();
        let audit = serde_json::json!({
            "event": "tool_audit",
            "call_id": invocation.id,
            "tool": invocation.tool,
            "ok": outcome_label == "ok",
            "outcome": outcome_label,
            "duration_ms": duration.as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let (result, failure) = match outcome {
            Ok(result) => {
                let failure = result.error.as_ref().map(|e| AgentError::ToolExecution {
                    tool: invocation.tool.clone(),
                    reason: e.clone(),
                });
                (result, failure)
            }
            Err(e) => (ToolResult::failure(e.to_string()), Some(e)),
        };

        ToolOutcome {
            invocation,
            result,
            failure,
            duration,
        }
    }

    /// 执行一步内的全部调用：连续的独立调用并发执行，遇到 depends_on_previous 时先等前一批完成；
    /// 返回值与输入顺序一一对应
    pub async fn dispatch_all(
        &self,
        tools: &ToolCollection,
        invocations: Vec<ToolInvocation>,
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(invocations.len());
        for batch in into_batches(invocations) {
            let results = join_all(batch.into_iter().map(|inv| self.execute(tools, inv))).await;
            outcomes.extend(results);
        }
        outcomes
    }
}

/// 按 depends_on_previous 切分批次
fn into_batches(invocations: Vec<ToolInvocation>) -> Vec<Vec<ToolInvocation>> {
    let mut batches: Vec<Vec<ToolInvocation>> = Vec::new();
    for inv in invocations {
        match batches.last_mut() {
            Some(current) if !inv.depends_on_previous => current.push(inv),
            _ => batches.push(vec![inv]),
        }
    }
    batches
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
