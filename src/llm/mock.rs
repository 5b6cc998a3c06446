//! Mock LLM 客户端（用于测试与 `hive run --mock`，无需 API）
//!
//! 预置回复按顺序弹出；队列为空时回显最后一条 User 消息并调用 finish 结束。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<usize>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置的回复依次返回
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(0),
        }
    }

    /// complete 被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let queued = self
            .replies
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front();
        if let Some(reply) = queued {
            return Ok(reply);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(serde_json::json!({
            "thought": "mock: echo the request and finish",
            "tool_calls": [
                {"tool": "finish", "args": {"output": format!("Echo from Mock: {}", last_user)}}
            ]
        })
        .to_string())
    }
}
