//! 装配：按 AppConfig 构建 LLM、工具集合与 Agent

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AgentConfig, AppConfig};
use crate::core::AgentError;
use crate::flow::{AgentFactory, StageSpec};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::mcp::McpClient;
use crate::react::{Agent, LlmPlanner};
use crate::tools::{EchoTool, FinishTool, ShellTool, ToolCollection};

/// provider 为 "mock" 或 use_mock 时返回 Mock，否则为 OpenAI 兼容客户端
pub fn build_llm(app: &AppConfig, agent: &AgentConfig, use_mock: bool) -> Arc<dyn LlmClient> {
    if use_mock || agent.provider == "mock" {
        tracing::info!(agent = %agent.name, "using mock llm");
        return Arc::new(MockLlmClient::new());
    }
    let api_key = std::env::var(&app.llm.api_key_env).ok();
    if api_key.is_none() {
        tracing::warn!(env = %app.llm.api_key_env, "api key env not set");
    }
    Arc::new(OpenAiClient::new(
        app.llm.base_url.as_deref(),
        &agent.model,
        api_key.as_deref(),
    ))
}

/// 内置工具：echo、finish、shell（按配置白名单），启用 browser feature 时加上 browser
pub fn build_tools(app: &AppConfig, agent: &AgentConfig) -> Result<ToolCollection, AgentError> {
    let mut tools = ToolCollection::new();
    tools.register(EchoTool)?;
    tools.register(FinishTool)?;
    tools.register(ShellTool::new(
        app.tools.shell.allowed_commands.clone(),
        agent.tool_timeout(),
    ))?;
    #[cfg(feature = "browser")]
    tools.register(crate::tools::BrowserTool::new(
        app.tools.browser.allowed_domains.clone(),
        app.tools.browser.max_result_chars,
    ))?;
    Ok(tools)
}

/// 构建 Agent：LLM 规划器 + 内置工具 + 配置中的 MCP 服务器
pub fn build_agent(
    app: &AppConfig,
    agent: AgentConfig,
    llm: Arc<dyn LlmClient>,
) -> Result<Agent, AgentError> {
    let planner = LlmPlanner::new(llm, agent.system_prompt.clone())
        .with_request_timeout(Duration::from_secs(app.llm.request_timeout_seconds));
    let tools = build_tools(app, &agent)?;
    let mut built = Agent::new(agent, Arc::new(planner), tools)?;
    for server in &app.mcp.servers {
        built = built.with_mcp(McpClient::from_config(server)?);
    }
    Ok(built)
}

/// 按 AppConfig 为每个阶段构建 Agent
pub struct ConfigAgentFactory {
    app: AppConfig,
    use_mock: bool,
}

impl ConfigAgentFactory {
    pub fn new(app: AppConfig, use_mock: bool) -> Self {
        Self { app, use_mock }
    }
}

impl AgentFactory for ConfigAgentFactory {
    fn build(&self, stage: &StageSpec) -> Result<Agent, AgentError> {
        let llm = build_llm(&self.app, &stage.config, self.use_mock);
        build_agent(&self.app, stage.config.clone(), llm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowBuilder, FlowContext};

    #[test]
    fn test_build_tools_from_config() {
        let app = AppConfig::default();
        let tools = build_tools(&app, &app.agent).unwrap();
        for name in ["echo", "finish", "shell"] {
            assert!(tools.contains(name), "missing {name}");
        }
    }

    #[tokio::test]
    async fn test_mock_agent_finishes() {
        let app = AppConfig::default();
        let llm = build_llm(&app, &app.agent, true);
        let agent = build_agent(&app, app.agent.clone(), llm).unwrap();
        let out = agent.run("ping").await.unwrap();
        assert_eq!(out.output, "Echo from Mock: ping");
        assert_eq!(out.steps, 1);
    }

    #[tokio::test]
    async fn test_config_factory_runs_flow() {
        let flow = FlowBuilder::new("mocked")
            .stage("first", AgentConfig::default())
            .stage("second", AgentConfig::default())
            .factory(ConfigAgentFactory::new(AppConfig::default(), true))
            .build()
            .unwrap();
        let outcome = flow.run_flow(FlowContext::with_input("hi")).await.unwrap();
        assert_eq!(outcome.context.get_str("first"), Some("Echo from Mock: hi"));
        assert_eq!(
            outcome.final_output(),
            Some("Echo from Mock: Echo from Mock: hi")
        );
    }
}
