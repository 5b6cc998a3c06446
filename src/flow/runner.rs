//! Flow 执行器
//!
//! 按顺序运行各阶段：每个阶段由 AgentFactory 构建独立的 Agent，输入为上一阶段输出加上声明的上下文键，
//! 输出写回上下文。任一阶段进入 ERROR 即停止，后续阶段不再执行。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::core::AgentError;
use crate::flow::types::{
    render_value, FlowContext, FlowError, FlowOutcome, StageAudit, StageSpec, INITIAL_INPUT_KEY,
};
use crate::memory::Message;
use crate::react::Agent;

/// 阶段 Agent 的构建者（显式注册表，由宿主提供）
pub trait AgentFactory: Send + Sync {
    fn build(&self, stage: &StageSpec) -> Result<Agent, AgentError>;
}

impl<F> AgentFactory for F
where
    F: Fn(&StageSpec) -> Result<Agent, AgentError> + Send + Sync,
{
    fn build(&self, stage: &StageSpec) -> Result<Agent, AgentError> {
        self(stage)
    }
}

/// 由阶段列表、AgentFactory 与取消令牌组成的可执行 Flow
pub struct Flow {
    name: String,
    stages: Vec<StageSpec>,
    factory: Arc<dyn AgentFactory>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("stages", &self.stages.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish()
    }
}

impl Flow {
    pub(crate) fn new(
        name: String,
        stages: Vec<StageSpec>,
        factory: Arc<dyn AgentFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            stages,
            factory,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 取消整个 Flow：当前阶段的 Agent 收到取消，后续阶段不再执行
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn run_flow(&self, initial: FlowContext) -> Result<FlowOutcome, FlowError> {
        tracing::info!(flow = %self.name, stages = self.stages.len(), "flow started");
        let result = run_flow(self.factory.as_ref(), &self.stages, initial, &self.cancel).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(flow = %self.name, keys = ?outcome.context.keys(), "flow completed")
            }
            Err(e) => tracing::warn!(flow = %self.name, error = %e, "flow failed"),
        }
        result
    }
}

/// 校验阶段列表：非空、阶段名唯一
pub fn validate_stages(stages: &[StageSpec]) -> Result<(), FlowError> {
    if stages.is_empty() {
        return Err(FlowError::InvalidDefinition("flow has no stages".to_string()));
    }
    let mut seen = HashSet::new();
    for stage in stages {
        if stage.name.trim().is_empty() {
            return Err(FlowError::InvalidDefinition("stage name is empty".to_string()));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(FlowError::InvalidDefinition(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
    }
    Ok(())
}

/// 阶段 Agent 默认以阶段名命名
fn stage_with_agent_name(stage: &StageSpec) -> StageSpec {
    let mut spec = stage.clone();
    if spec.config.name == AgentConfig::default().name {
        spec.config.name = spec.name.clone();
    }
    spec
}

/// 顺序执行阶段；第一个阶段的“上一阶段输出”取初始上下文的 `input` 键
pub async fn run_flow(
    factory: &dyn AgentFactory,
    stages: &[StageSpec],
    initial: FlowContext,
    cancel: &CancellationToken,
) -> Result<FlowOutcome, FlowError> {
    validate_stages(stages)?;

    let mut context = initial;
    let mut audit: Vec<StageAudit> = Vec::with_capacity(stages.len());
    let mut previous: Option<String> = context.get(INITIAL_INPUT_KEY).map(render_value);

    for (index, stage) in stages.iter().enumerate() {
        let failed = |error: AgentError, audit: Vec<StageAudit>, failed_trace: Vec<Message>| FlowError::StageFailed {
            stage: stage.name.clone(),
            index,
            error,
            audit,
            failed_trace,
        };

        if cancel.is_cancelled() {
            return Err(failed(AgentError::Cancelled, audit, Vec::new()));
        }

        let spec = stage_with_agent_name(stage);
        let agent = match factory.build(&spec) {
            Ok(agent) => agent.with_cancel_token(cancel.clone()),
            Err(e) => {
                tracing::warn!(stage = %stage.name, index, error = %e, "stage agent could not be built");
                return Err(failed(e, audit, Vec::new()));
            }
        };

        let input = spec.render_input(previous.as_deref(), &context);
        let started_at = chrono::Utc::now().timestamp_millis();
        tracing::info!(stage = %stage.name, index, input_chars = input.chars().count(), "stage started");

        match agent.run(&input).await {
            Ok(out) => {
                let key = spec.output_key().to_string();
                context.insert(key.clone(), Value::String(out.output.clone()));
                tracing::info!(stage = %stage.name, index, steps = out.steps, reason = ?out.reason, "stage finished");
                previous = Some(out.output.clone());
                audit.push(StageAudit {
                    stage: stage.name.clone(),
                    index,
                    input,
                    output: out.output,
                    output_key: key,
                    steps: out.steps,
                    reason: out.reason,
                    trace: out.trace,
                    started_at,
                    finished_at: chrono::Utc::now().timestamp_millis(),
                });
            }
            Err(failure) => {
                tracing::warn!(stage = %stage.name, index, error = %failure.error, steps = failure.steps, "stage failed, halting flow");
                return Err(failed(failure.error, audit, failure.trace));
            }
        }
    }

    Ok(FlowOutcome { context, audit })
}
