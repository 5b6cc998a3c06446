//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：给定对话历史返回一段补全文本。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
