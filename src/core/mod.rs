//! 核心层：错误与恢复、状态机、工具并发调度、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::{AgentError, RecoveryAction, RunFailure, TimeoutScope};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{AgentState, AgentStatus, FinishReason};
pub use task_scheduler::TaskScheduler;
