//! 推理层：意图策略、LLM 规划器与 Agent 步循环

pub mod agent;
pub mod events;
pub mod planner;
pub mod strategy;

pub use agent::{Agent, RunOutput};
pub use events::AgentEvent;
pub use planner::{parse_llm_output, LlmPlanner, DEFAULT_SYSTEM_PROMPT};
pub use strategy::{last_user_message, FnStrategy, Intent, IntentContext, IntentStrategy, ScriptedStrategy};
