//! Agent：状态机驱动的步循环
//!
//! IDLE --run--> RUNNING --(终止工具 / 步数耗尽 / 策略完成)--> FINISHED
//!                       --(不可恢复错误 / 取消 / 超时)--> ERROR
//!
//! 每一步：读取 Memory -> 策略推导意图 -> 并发调度工具 -> 按请求顺序写回 Memory -> 更新状态。
//! 普通工具的失败只记录为 tool 消息；终止工具（默认 finish）的任何失败都会使 run 进入 ERROR。
//! Agent 不可重入：RUNNING 时再次 run 立即返回 Busy，正在进行的 run 不受影响。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::core::{
    AgentError, AgentState, AgentStatus, FinishReason, RecoveryAction, RecoveryEngine, RunFailure,
    TaskScheduler, TimeoutScope,
};
use crate::mcp::{McpClient, McpProxyTool};
use crate::memory::{Memory, Message, Role, ToolCallRef};
use crate::react::events::AgentEvent;
use crate::react::strategy::{Intent, IntentContext, IntentStrategy};
use crate::tools::{Tool, ToolCollection, ToolExecutor, ToolInvocation, ToolOutcome};

const TRUNCATED_MARKER: &str = "\n…[truncated]";
const PREVIEW_CHARS: usize = 200;

/// 成功结束（FINISHED）的 run 结果
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub output: String,
    pub steps: usize,
    pub reason: FinishReason,
    pub trace: Vec<Message>,
}

struct AgentInner {
    memory: Memory,
    tools: ToolCollection,
    steps: usize,
    last_error: Option<String>,
    /// MCP 服务器名 -> 已注册代理所属的会话 id
    remote_sessions: HashMap<String, String>,
}

pub struct Agent {
    config: AgentConfig,
    state: Mutex<AgentState>,
    inner: tokio::sync::Mutex<AgentInner>,
    progress: AtomicUsize,
    strategy: Arc<dyn IntentStrategy>,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    cancel: Mutex<CancellationToken>,
    parent_cancel: Option<CancellationToken>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    mcp: Vec<Arc<McpClient>>,
}

enum StepWait {
    Done(Vec<ToolOutcome>),
    TimedOut,
    Cancelled,
}

fn truncate_observation(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(TRUNCATED_MARKER);
    cut
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

impl Agent {
    /// 校验配置并按 enabled_tools 裁剪工具集合
    pub fn new(
        config: AgentConfig,
        strategy: Arc<dyn IntentStrategy>,
        mut tools: ToolCollection,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        if !config.enabled_tools.is_empty() {
            tools.retain(|name| {
                let keep = config.enabled_tools.iter().any(|t| t == name);
                if !keep {
                    tracing::debug!(agent = %config.name, tool = %name, "tool not enabled, dropped");
                }
                keep
            });
        }
        let executor = ToolExecutor::new(
            config.tool_timeout(),
            TaskScheduler::new(config.max_concurrent_tools),
        );
        Ok(Self {
            inner: tokio::sync::Mutex::new(AgentInner {
                memory: Memory::new(config.max_memory_messages),
                tools,
                steps: 0,
                last_error: None,
                remote_sessions: HashMap::new(),
            }),
            state: Mutex::new(AgentState::Idle),
            progress: AtomicUsize::new(0),
            strategy,
            executor,
            recovery: RecoveryEngine::new(),
            cancel: Mutex::new(CancellationToken::new()),
            parent_cancel: None,
            events: None,
            mcp: Vec::new(),
            config,
        })
    }

    /// 挂载 MCP 服务器：首次 run 时建立会话，run 结束时关闭
    pub fn with_mcp(mut self, client: Arc<McpClient>) -> Self {
        self.mcp.push(client);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// 外部取消令牌（Flow / 进程关闭）；每次 run 使用它的子令牌
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.parent_cancel = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, to: AgentState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition(to) {
            tracing::debug!(agent = %self.config.name, from = ?*state, to = ?to, "state transition");
            *state = to;
        } else {
            tracing::warn!(agent = %self.config.name, from = ?*state, to = ?to, "illegal state transition ignored");
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn registration_guard(&self) -> Result<tokio::sync::MutexGuard<'_, AgentInner>, AgentError> {
        let state = self.state();
        if state != AgentState::Idle {
            return Err(AgentError::RegistrationClosed(state));
        }
        self.inner
            .try_lock()
            .map_err(|_| AgentError::RegistrationClosed(AgentState::Running))
    }

    /// 注册工具；只允许在 IDLE 时调用
    pub fn register_tool(&self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_tool_arc(Arc::new(tool))
    }

    pub fn register_tool_arc(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let mut inner = self.registration_guard()?;
        inner.tools.register_arc(tool)
    }

    /// 注册并覆盖同名工具（输出告警）
    pub fn register_tool_override(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let mut inner = self.registration_guard()?;
        inner.tools.register_with(tool, true)
    }

    /// 状态快照；RUNNING 期间 memory_len 与 tools 取不到时留空
    pub fn status(&self) -> AgentStatus {
        let state = self.state();
        match self.inner.try_lock() {
            Ok(inner) => AgentStatus {
                name: self.config.name.clone(),
                state,
                steps: inner.steps,
                memory_len: inner.memory.len(),
                tools: inner.tools.names(),
                last_error: inner.last_error.clone(),
            },
            Err(_) => AgentStatus {
                name: self.config.name.clone(),
                state,
                steps: self.progress.load(Ordering::SeqCst),
                memory_len: 0,
                tools: Vec::new(),
                last_error: None,
            },
        }
    }

    /// 完整 Memory 轨迹（RUNNING 时等待 run 结束）
    pub async fn trace(&self) -> Vec<Message> {
        self.inner.lock().await.memory.snapshot()
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.inner.lock().await.tools.names()
    }

    /// 取消当前 run：不再发起新调用，进行中的调用有 cancel_grace 的宽限期
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// 终态 -> IDLE，清空 Memory 与步数；RUNNING 时返回 Busy
    pub fn reset(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == AgentState::Running {
            return Err(AgentError::Busy);
        }
        let mut inner = self.inner.try_lock().map_err(|_| AgentError::Busy)?;
        inner.memory.clear();
        inner.steps = 0;
        inner.last_error = None;
        self.progress.store(0, Ordering::SeqCst);
        *state = AgentState::Idle;
        tracing::info!(agent = %self.config.name, "agent reset");
        Ok(())
    }

    /// 执行一次请求，直到 FINISHED 或 ERROR
    pub async fn run(&self, request: &str) -> Result<RunOutput, RunFailure> {
        if request.trim().is_empty() {
            return Err(RunFailure::immediate(AgentError::EmptyRequest));
        }
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                AgentState::Running => return Err(RunFailure::immediate(AgentError::Busy)),
                s @ (AgentState::Finished | AgentState::Error) => {
                    return Err(RunFailure::immediate(AgentError::AlreadyTerminated(s)))
                }
                AgentState::Idle => *state = AgentState::Running,
            }
        }

        let token = match &self.parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        let mut inner = self.inner.lock().await;
        tracing::info!(agent = %self.config.name, max_steps = self.config.max_steps, "run started");
        inner.memory.push(Message::user(request));

        self.connect_remote(&mut inner).await;

        let result = match tokio::time::timeout(
            self.config.run_timeout(),
            self.step_loop(&mut inner, &token),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(AgentError::Timeout(TimeoutScope::Run)),
        };

        self.disconnect_remote(&mut inner).await;
        let trace = inner.memory.snapshot();
        let steps = inner.steps;

        match result {
            Ok((output, reason)) => {
                self.set_state(AgentState::Finished);
                tracing::info!(agent = %self.config.name, steps, reason = ?reason, "run finished");
                self.emit(AgentEvent::Finished {
                    output: output.clone(),
                    reason: reason.clone(),
                });
                Ok(RunOutput {
                    output,
                    steps,
                    reason,
                    trace,
                })
            }
            Err(error) => {
                inner.last_error = Some(error.to_string());
                self.set_state(AgentState::Error);
                tracing::warn!(agent = %self.config.name, steps, error = %error, "run failed");
                self.emit(AgentEvent::Error {
                    text: error.to_string(),
                });
                Err(RunFailure::new(error, steps, trace))
            }
        }
    }

    async fn step_loop(
        &self,
        inner: &mut AgentInner,
        token: &CancellationToken,
    ) -> Result<(String, FinishReason), AgentError> {
        let max_steps = self.config.max_steps;
        while inner.steps < max_steps {
            if token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            inner.steps += 1;
            let step = inner.steps;
            self.progress.store(step, Ordering::SeqCst);
            self.set_state(AgentState::Running);
            self.emit(AgentEvent::StepUpdate {
                agent: self.config.name.clone(),
                step,
                max_steps,
            });

            self.sync_remote_tools(inner);

            let snapshot = inner.memory.snapshot();
            let ctx = IntentContext {
                memory: &snapshot,
                tools: &inner.tools,
                step,
                max_steps,
            };
            let derived = tokio::select! {
                _ = token.cancelled() => return Err(AgentError::Cancelled),
                r = self.strategy.derive(&ctx) => r,
            };

            let intent = match derived {
                Ok(intent) => intent,
                Err(e) => match self.recovery.handle(&e, false) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        tracing::warn!(agent = %self.config.name, step, error = %e, "intent rejected, retrying with prompt");
                        self.emit(AgentEvent::Recovery {
                            action: "retry_with_prompt".to_string(),
                            detail: e.to_string(),
                        });
                        inner.memory.push(Message::user(prompt));
                        continue;
                    }
                    RecoveryAction::RecordAndContinue => {
                        inner.memory.push(Message::user(format!("Error: {}", e)));
                        continue;
                    }
                    RecoveryAction::Abort => return Err(e),
                },
            };

            match intent {
                Intent::Complete(text) => {
                    inner.memory.push(Message::assistant(text.clone()));
                    return Ok((text, FinishReason::Completed));
                }
                Intent::Act { thought, calls } => {
                    if let Some(done) = self.act(inner, token, thought, calls).await? {
                        return Ok(done);
                    }
                }
            }
        }

        let last = inner
            .memory
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        tracing::info!(agent = %self.config.name, max_steps, "step budget exhausted");
        Ok((last, FinishReason::StepBudgetExhausted))
    }

    /// 执行一步的工具调用；返回 Some 表示遇到终止结果
    async fn act(
        &self,
        inner: &mut AgentInner,
        token: &CancellationToken,
        thought: Option<String>,
        calls: Vec<ToolInvocation>,
    ) -> Result<Option<(String, FinishReason)>, AgentError> {
        let names: Vec<&str> = calls.iter().map(|c| c.tool.as_str()).collect();
        let has_thought = thought.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false);
        let content = match thought {
            Some(t) if has_thought => t,
            _ if names.is_empty() => "(no tool calls)".to_string(),
            _ => format!("Calling tools: {}", names.join(", ")),
        };
        self.emit(AgentEvent::Thinking {
            text: preview(&content),
        });
        inner.memory.push(Message::assistant(content));
        if has_thought {
            self.nudge_if_stuck(inner);
        }
        if calls.is_empty() {
            return Ok(None);
        }

        for call in &calls {
            self.emit(AgentEvent::ToolCall {
                call_id: call.id.clone(),
                tool: call.tool.clone(),
                args: call.args.clone(),
            });
        }

        let exec = self.executor.dispatch_all(&inner.tools, calls);
        tokio::pin!(exec);
        let wait = tokio::select! {
            biased;
            _ = token.cancelled() => StepWait::Cancelled,
            r = tokio::time::timeout(self.config.step_timeout(), &mut exec) => match r {
                Ok(outcomes) => StepWait::Done(outcomes),
                Err(_) => StepWait::TimedOut,
            },
        };

        let outcomes = match wait {
            StepWait::Done(outcomes) => outcomes,
            StepWait::TimedOut => return Err(AgentError::Timeout(TimeoutScope::Step)),
            StepWait::Cancelled => {
                let grace = self.config.cancel_grace();
                match tokio::time::timeout(grace, &mut exec).await {
                    Ok(outcomes) => {
                        for outcome in outcomes {
                            self.record_outcome(&mut inner.memory, &outcome);
                        }
                    }
                    Err(_) => {
                        tracing::warn!(agent = %self.config.name, grace = ?grace, "in-flight tool calls abandoned after cancel");
                    }
                }
                return Err(AgentError::Cancelled);
            }
        };

        let mut fatal: Option<AgentError> = None;
        let mut terminal: Option<(String, FinishReason)> = None;
        for outcome in &outcomes {
            self.record_outcome(&mut inner.memory, outcome);
            let tool = &outcome.invocation.tool;
            if let Some(err) = &outcome.failure {
                let on_terminal = self.config.is_terminal_tool(tool);
                let action = self.recovery.handle(err, on_terminal);
                if on_terminal && action == RecoveryAction::Abort && fatal.is_none() {
                    tracing::warn!(agent = %self.config.name, tool = %tool, error = %err, "terminal tool failed");
                    fatal = Some(err.clone());
                }
            } else if outcome.is_terminal() && terminal.is_none() {
                terminal = Some((
                    outcome.result.output_text(),
                    FinishReason::TerminalTool(tool.clone()),
                ));
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        Ok(terminal)
    }

    fn record_outcome(&self, memory: &mut Memory, outcome: &ToolOutcome) {
        let observation = truncate_observation(
            outcome.result.to_observation(),
            self.config.max_observe_chars,
        );
        match &outcome.failure {
            Some(err) => self.emit(AgentEvent::ToolFailure {
                tool: outcome.invocation.tool.clone(),
                reason: err.to_string(),
            }),
            None => self.emit(AgentEvent::Observation {
                tool: outcome.invocation.tool.clone(),
                preview: preview(&observation),
            }),
        }
        memory.push(Message::tool(
            ToolCallRef {
                id: outcome.invocation.id.clone(),
                name: outcome.invocation.tool.clone(),
            },
            observation,
        ));
    }

    /// 最近 duplicate_threshold 条 assistant 思考完全相同时，追加一条换策略提示
    fn nudge_if_stuck(&self, inner: &mut AgentInner) {
        let threshold = self.config.duplicate_threshold;
        if threshold < 2 {
            return;
        }
        let recent: Vec<&str> = inner
            .memory
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .take(threshold)
            .map(|m| m.content.as_str())
            .collect();
        let stuck = recent.len() == threshold
            && !recent[0].trim().is_empty()
            && recent.iter().all(|c| *c == recent[0]);
        if stuck {
            let nudge = "Observed duplicate reasoning. Consider a different strategy, avoid repeating the same tool calls, or call `finish` if the task is done.";
            tracing::warn!(agent = %self.config.name, "agent appears stuck, nudging");
            self.emit(AgentEvent::Recovery {
                action: "stuck_nudge".to_string(),
                detail: nudge.to_string(),
            });
            inner.memory.push(Message::user(nudge));
        }
    }

    async fn connect_remote(&self, inner: &mut AgentInner) {
        for client in &self.mcp {
            if let Err(e) = client.connect().await {
                tracing::warn!(agent = %self.config.name, server = %client.name(), error = %e, "mcp connect failed, remote tools unavailable");
            }
        }
        self.sync_remote_tools(inner);
    }

    /// 用当前会话的代理替换旧会话的代理，并清理所有不可用工具
    fn sync_remote_tools(&self, inner: &mut AgentInner) {
        for client in &self.mcp {
            let current = client.current();
            let known = inner.remote_sessions.get(client.name()).cloned();
            if let (Some(session), Some(id)) = (&current, &known) {
                if session.id() == id {
                    continue;
                }
            }

            let mut removed = Vec::new();
            if let Some(old) = known {
                removed = inner.tools.unregister_origin(&old);
                inner.remote_sessions.remove(client.name());
            }
            let mut added = Vec::new();
            if let Some(session) = current {
                for proxy in McpProxyTool::for_session(&session) {
                    let name = proxy.name().to_string();
                    if !self.config.enabled_tools.is_empty()
                        && !self.config.enabled_tools.contains(&name)
                    {
                        continue;
                    }
                    match inner.tools.register_arc(proxy) {
                        Ok(()) => added.push(name),
                        Err(e) => {
                            tracing::warn!(agent = %self.config.name, server = %client.name(), error = %e, "remote tool shadowed by existing tool");
                        }
                    }
                }
                inner
                    .remote_sessions
                    .insert(client.name().to_string(), session.id().to_string());
            }
            if !added.is_empty() || !removed.is_empty() {
                tracing::info!(agent = %self.config.name, server = %client.name(), added = ?added, removed = ?removed, "remote tools updated");
                self.emit(AgentEvent::RemoteToolsChanged {
                    server: client.name().to_string(),
                    added,
                    removed,
                });
            }
        }
        inner.tools.sweep_unavailable();
    }

    async fn disconnect_remote(&self, inner: &mut AgentInner) {
        for client in &self.mcp {
            client.close().await;
        }
        if !self.mcp.is_empty() {
            self.sync_remote_tools(inner);
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("mcp", &self.mcp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::strategy::ScriptedStrategy;
    use crate::tools::{EchoTool, FinishTool, ToolResult};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Sleepy(u64);

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            Ok(ToolResult::text("rested"))
        }
    }

    fn tools() -> ToolCollection {
        let mut tools = ToolCollection::new();
        tools.register(EchoTool).unwrap();
        tools.register(FinishTool).unwrap();
        tools
    }

    fn agent(strategy: ScriptedStrategy) -> Agent {
        Agent::new(AgentConfig::named("test"), Arc::new(strategy), tools()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_request_keeps_idle() {
        let agent = agent(ScriptedStrategy::default());
        let err = agent.run("   ").await.unwrap_err();
        assert_eq!(err.error, AgentError::EmptyRequest);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_completion_finishes() {
        let agent = agent(ScriptedStrategy::new([Intent::Complete("done".to_string())]));
        let out = agent.run("hello").await.unwrap();
        assert_eq!(out.output, "done");
        assert_eq!(out.reason, FinishReason::Completed);
        assert_eq!(agent.state(), AgentState::Finished);
    }

    #[tokio::test]
    async fn test_terminal_state_requires_reset() {
        let agent = agent(ScriptedStrategy::repeating(Intent::Complete("ok".to_string())));
        agent.run("one").await.unwrap();
        let err = agent.run("two").await.unwrap_err();
        assert_eq!(err.error, AgentError::AlreadyTerminated(AgentState::Finished));

        agent.reset().unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.status().memory_len, 0);
        assert!(agent.run("three").await.is_ok());
    }

    #[tokio::test]
    async fn test_registration_closed_after_run() {
        let agent = agent(ScriptedStrategy::new([Intent::Complete("ok".to_string())]));
        agent.register_tool(Sleepy(1)).unwrap();
        assert_eq!(
            agent.register_tool(EchoTool).unwrap_err(),
            AgentError::DuplicateTool("echo".to_string())
        );
        agent.run("go").await.unwrap();
        assert_eq!(
            agent.register_tool(Sleepy(1)).unwrap_err(),
            AgentError::RegistrationClosed(AgentState::Finished)
        );
    }

    #[tokio::test]
    async fn test_enabled_tools_filter() {
        let config = AgentConfig {
            enabled_tools: vec!["finish".to_string()],
            ..AgentConfig::named("narrow")
        };
        let agent = Agent::new(config, Arc::new(ScriptedStrategy::default()), tools()).unwrap();
        assert_eq!(agent.tool_names().await, vec!["finish".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = AgentConfig {
            max_steps: 0,
            ..AgentConfig::default()
        };
        let err = Agent::new(config, Arc::new(ScriptedStrategy::default()), tools()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_intent_parse_error_is_retried() {
        let strategy = ScriptedStrategy::default()
            .then_error(AgentError::IntentParse("garbage".to_string()))
            .then(Intent::call("finish", json!({"output": "recovered"})));
        let agent = agent(strategy);
        let out = agent.run("go").await.unwrap();
        assert_eq!(out.output, "recovered");
        assert_eq!(out.steps, 2);
        assert!(out
            .trace
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("JSON")));
    }

    #[tokio::test]
    async fn test_llm_error_is_fatal() {
        let strategy = ScriptedStrategy::default().then_error(AgentError::Llm("503".to_string()));
        let agent = agent(strategy);
        let err = agent.run("go").await.unwrap_err();
        assert_eq!(err.error, AgentError::Llm("503".to_string()));
        assert_eq!(agent.state(), AgentState::Error);
        assert_eq!(agent.status().last_error.as_deref(), Some("LLM error: 503"));
    }

    #[tokio::test]
    async fn test_observation_truncated() {
        let config = AgentConfig {
            max_observe_chars: 5,
            ..AgentConfig::named("short")
        };
        let strategy = ScriptedStrategy::new([
            Intent::call("echo", json!({"text": "abcdefghij"})),
            Intent::Complete("ok".to_string()),
        ]);
        let agent = Agent::new(config, Arc::new(strategy), tools()).unwrap();
        let out = agent.run("go").await.unwrap();
        let tool_msg = out.trace.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.content, format!("abcde{}", TRUNCATED_MARKER));
    }

    #[tokio::test]
    async fn test_stuck_nudge() {
        let strategy = ScriptedStrategy::repeating(Intent::act_with_thought(
            "same idea",
            vec![ToolInvocation::new("echo", json!({"text": "x"}))],
        ));
        let config = AgentConfig {
            max_steps: 2,
            ..AgentConfig::named("stuck")
        };
        let agent = Agent::new(config, Arc::new(strategy), tools()).unwrap();
        let out = agent.run("go").await.unwrap();
        assert_eq!(out.reason, FinishReason::StepBudgetExhausted);
        assert!(out
            .trace
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("duplicate reasoning")));
    }

    #[tokio::test]
    async fn test_cancel_moves_to_error() {
        let strategy = ScriptedStrategy::repeating(Intent::call("sleepy", json!({})));
        let config = AgentConfig {
            cancel_grace_seconds: 0,
            ..AgentConfig::named("cancel")
        };
        let agent = Arc::new(Agent::new(config, Arc::new(strategy), tools()).unwrap());
        agent.register_tool(Sleepy(5_000)).unwrap();

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.run("go").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.error, AgentError::Cancelled);
        assert_eq!(agent.state(), AgentState::Error);
    }

    #[tokio::test]
    async fn test_external_token_cancels_run() {
        let parent = CancellationToken::new();
        let strategy = ScriptedStrategy::repeating(Intent::call("sleepy", json!({})));
        let config = AgentConfig {
            cancel_grace_seconds: 0,
            ..AgentConfig::named("flow-stage")
        };
        let agent = Agent::new(config, Arc::new(strategy), tools())
            .unwrap()
            .with_cancel_token(parent.clone());
        agent.register_tool(Sleepy(5_000)).unwrap();
        parent.cancel();
        let err = agent.run("go").await.unwrap_err();
        assert_eq!(err.error, AgentError::Cancelled);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let strategy = ScriptedStrategy::repeating(Intent::call("sleepy", json!({})));
        let config = AgentConfig {
            step_timeout_seconds: 1,
            tool_timeout_seconds: 10,
            ..AgentConfig::named("slow")
        };
        let agent = Agent::new(config, Arc::new(strategy), tools()).unwrap();
        agent.register_tool(Sleepy(3_000)).unwrap();
        let err = agent.run("go").await.unwrap_err();
        assert_eq!(err.error, AgentError::Timeout(TimeoutScope::Step));
        assert_eq!(err.steps, 1);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let strategy = ScriptedStrategy::new([Intent::call("finish", json!({"output": "bye"}))]);
        let agent = agent(strategy).with_events(tx);
        agent.run("go").await.unwrap();
        drop(agent);
        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            kinds.push(serde_json::to_value(&ev).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec!["step_update", "thinking", "tool_call", "observation", "finished"]
        );
    }
}
