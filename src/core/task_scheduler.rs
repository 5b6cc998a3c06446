//! 工具并发调度：同一步内多个独立工具调用共享 Semaphore 许可
//!
//! 许可数来自配置 max_concurrent_tools；调用方在执行工具前 acquire，drop 即归还。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 任务调度器
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    /// 工具并发限制（默认 4）
    tool_semaphore: Arc<Semaphore>,
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let max_concurrent_tools = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools)),
            max_concurrent_tools,
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Cancelled)
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_returned_on_drop() {
        let sched = TaskScheduler::new(2);
        let p1 = sched.acquire_tool().await.unwrap();
        let _p2 = sched.acquire_tool().await.unwrap();
        assert_eq!(sched.available(), 0);
        drop(p1);
        assert_eq!(sched.available(), 1);
    }

    #[test]
    fn test_zero_is_clamped_to_one() {
        let sched = TaskScheduler::new(0);
        assert_eq!(sched.max_concurrent_tools(), 1);
    }
}
