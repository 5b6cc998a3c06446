//! Flow 构建器
//!
//! 提供流畅的 API 构建 Flow，或从 TOML 定义文件加载阶段列表

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{unknown_agent_keys, AgentConfig};
use crate::flow::runner::{validate_stages, AgentFactory, Flow};
use crate::flow::types::{FlowError, StageSpec};

/// Flow 定义文件（TOML）
///
/// ```toml
/// name = "research"
///
/// [[stages]]
/// name = "gather"
/// instruction = "Collect facts."
/// inputs = ["topic"]
///
/// [stages.agent]
/// max_steps = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDefinition {
    #[serde(default = "default_flow_name")]
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

fn default_flow_name() -> String {
    "flow".to_string()
}

impl FlowDefinition {
    /// 解析定义；阶段 agent 表中的未知选项被忽略并 warn
    pub fn from_toml_str(s: &str) -> Result<Self, FlowError> {
        let raw: toml::Value =
            toml::from_str(s).map_err(|e| FlowError::InvalidDefinition(e.to_string()))?;
        unknown_stage_keys(&raw);
        let def: FlowDefinition = raw
            .try_into()
            .map_err(|e: toml::de::Error| FlowError::InvalidDefinition(e.to_string()))?;
        validate_stages(&def.stages)?;
        for stage in &def.stages {
            stage.config.validate().map_err(|e| {
                FlowError::InvalidDefinition(format!("stage '{}': {}", stage.name, e))
            })?;
        }
        Ok(def)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FlowError::InvalidDefinition(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// 返回各阶段 agent 表中未识别的键（`stages.<阶段名>.agent.<key>`），并逐个 warn
pub fn unknown_stage_keys(raw: &toml::Value) -> Vec<String> {
    let mut unknown = Vec::new();
    let Some(stages) = raw.get("stages").and_then(toml::Value::as_array) else {
        return unknown;
    };
    for (index, stage) in stages.iter().enumerate() {
        let Some(agent) = stage.get("agent") else {
            continue;
        };
        let Ok(serde_json::Value::Object(table)) = serde_json::to_value(agent) else {
            continue;
        };
        let label = stage
            .get("name")
            .and_then(toml::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", index));
        for key in unknown_agent_keys(&table) {
            let path = format!("stages.{}.agent.{}", label, key);
            tracing::warn!(key = %path, "unknown stage option ignored");
            unknown.push(path);
        }
    }
    unknown
}

/// Flow 构建器
pub struct FlowBuilder {
    name: String,
    stages: Vec<StageSpec>,
    factory: Option<Arc<dyn AgentFactory>>,
    cancel: Option<CancellationToken>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            factory: None,
            cancel: None,
        }
    }

    /// 从定义文件内容创建（仍需设置 factory）
    pub fn from_definition(def: FlowDefinition) -> Self {
        Self {
            stages: def.stages,
            ..Self::new(def.name)
        }
    }

    /// 追加一个阶段
    pub fn stage(mut self, name: impl Into<String>, config: AgentConfig) -> Self {
        self.stages.push(StageSpec::new(name, config));
        self
    }

    pub fn stage_spec(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    fn last_stage(&mut self) -> Option<&mut StageSpec> {
        self.stages.last_mut()
    }

    /// 设置最近添加阶段需要带入的上下文键
    pub fn inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(stage) = self.last_stage() {
            stage.inputs = keys.into_iter().map(Into::into).collect();
        }
        self
    }

    /// 设置最近添加阶段的输出键
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        if let Some(stage) = self.last_stage() {
            stage.output_key = Some(key.into());
        }
        self
    }

    /// 设置最近添加阶段的指令
    pub fn instruction(mut self, text: impl Into<String>) -> Self {
        if let Some(stage) = self.last_stage() {
            stage.instruction = Some(text.into());
        }
        self
    }

    pub fn factory(mut self, factory: impl AgentFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn factory_arc(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// 外部取消令牌（如进程关闭）；未设置时 Flow 自带一个
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 构建 Flow
    pub fn build(self) -> Result<Flow, FlowError> {
        validate_stages(&self.stages)?;
        let factory = self
            .factory
            .ok_or_else(|| FlowError::InvalidDefinition("agent factory is required".to_string()))?;
        Ok(Flow::new(
            self.name,
            self.stages,
            factory,
            self.cancel.unwrap_or_default(),
        ))
    }
}
