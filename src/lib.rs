//! Hive - Rust 智能体编排运行时
//!
//! 模块划分：
//! - **bootstrap**: 按配置装配 LLM、工具与 Agent
//! - **cli**: 命令行参数
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、状态机、并发调度、优雅关闭
//! - **flow**: 多阶段 Flow（阶段间传递上下文）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: MCP 远程工具（stdio / SSE 传输、会话、重连、服务端）
//! - **memory**: Agent 独占的有界消息日志与轨迹持久化
//! - **react**: 意图策略、LLM 规划器、Agent 步循环
//! - **tools**: 工具集合、参数校验、并发执行器与内置工具

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod core;
pub mod flow;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::config::{load_config, AgentConfig, AppConfig};
pub use crate::core::{AgentError, AgentState, FinishReason, RunFailure};
pub use crate::flow::{Flow, FlowBuilder, FlowContext, FlowError};
pub use crate::react::{Agent, RunOutput};
pub use crate::tools::{Tool, ToolCollection, ToolResult};
