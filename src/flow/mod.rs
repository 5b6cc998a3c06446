//! Flow：把多个 Agent 串成顺序阶段，上下文在阶段之间传递

pub mod builder;
pub mod runner;
pub mod types;

pub use builder::{unknown_stage_keys, FlowBuilder, FlowDefinition};
pub use runner::{run_flow, validate_stages, AgentFactory, Flow};
pub use types::{FlowContext, FlowError, FlowOutcome, StageAudit, StageSpec, INITIAL_INPUT_KEY};
