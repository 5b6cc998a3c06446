//! 意图策略：Agent 每一步从 Memory 推导出要做什么
//!
//! 同一个 Agent 通过注入不同的 IntentStrategy 获得不同行为：LLM 规划器、预置脚本、闭包。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::memory::Message;
use crate::tools::{ToolCollection, ToolInvocation};

/// 一步的意图
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// 执行一组工具调用
    Act {
        thought: Option<String>,
        calls: Vec<ToolInvocation>,
    },
    /// 直接给出最终结果
    Complete(String),
}

impl Intent {
    pub fn act(calls: Vec<ToolInvocation>) -> Self {
        Intent::Act {
            thought: None,
            calls,
        }
    }

    pub fn act_with_thought(thought: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        Intent::Act {
            thought: Some(thought.into()),
            calls,
        }
    }

    /// 单个工具调用
    pub fn call(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self::act(vec![ToolInvocation::new(tool, args)])
    }
}

/// 推导意图时可见的上下文
pub struct IntentContext<'a> {
    pub memory: &'a [Message],
    pub tools: &'a ToolCollection,
    pub step: usize,
    pub max_steps: usize,
}

#[async_trait]
pub trait IntentStrategy: Send + Sync {
    async fn derive(&self, ctx: &IntentContext<'_>) -> Result<Intent, AgentError>;
}

/// 预置脚本：按顺序返回意图；耗尽后重复 repeat，未设置则直接结束
#[derive(Debug, Default)]
pub struct ScriptedStrategy {
    script: Mutex<VecDeque<Result<Intent, AgentError>>>,
    repeat: Option<Intent>,
}

impl ScriptedStrategy {
    pub fn new(intents: impl IntoIterator<Item = Intent>) -> Self {
        Self {
            script: Mutex::new(intents.into_iter().map(Ok).collect()),
            repeat: None,
        }
    }

    /// 每一步都返回同一个意图
    pub fn repeating(intent: Intent) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(intent),
        }
    }

    /// 在脚本中插入一次推导失败
    pub fn then_error(self, err: AgentError) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(err));
        }
        self
    }

    pub fn then(self, intent: Intent) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(intent));
        }
        self
    }
}

#[async_trait]
impl IntentStrategy for ScriptedStrategy {
    async fn derive(&self, _ctx: &IntentContext<'_>) -> Result<Intent, AgentError> {
        let next = self
            .script
            .lock()
            .map_err(|e| AgentError::IntentParse(e.to_string()))?
            .pop_front();
        match next {
            Some(step) => step,
            None => Ok(self
                .repeat
                .clone()
                .unwrap_or_else(|| Intent::Complete("script exhausted".to_string()))),
        }
    }
}

/// 闭包策略：根据上下文同步推导意图
pub struct FnStrategy<F> {
    f: F,
}

impl<F> FnStrategy<F>
where
    F: for<'a, 'b> Fn(&'a IntentContext<'b>) -> Result<Intent, AgentError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> IntentStrategy for FnStrategy<F>
where
    F: for<'a, 'b> Fn(&'a IntentContext<'b>) -> Result<Intent, AgentError> + Send + Sync,
{
    async fn derive(&self, ctx: &IntentContext<'_>) -> Result<Intent, AgentError> {
        (self.f)(ctx)
    }
}

/// 最近一条用户消息（请求或上游阶段输入）
pub fn last_user_message(memory: &[Message]) -> Option<&str> {
    memory
        .iter()
        .rev()
        .find(|m| m.role == crate::memory::Role::User)
        .map(|m| m.content.as_str())
}
