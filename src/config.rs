//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_STEPS=8`）。
//! 未知的键与段不会报错，只输出 warn；数值必须为正数，否则返回 AgentError::Config。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmSection,
    pub mcp: McpSection,
    pub tools: ToolsSection,
}

/// [agent] 段：单个 Agent 的运行参数
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_memory_messages")]
    pub max_memory_messages: usize,
    #[serde(default = "default_tool_timeout_seconds")]
    pub tool_timeout_seconds: u64,
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    /// 为空表示启用全部已注册工具
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    /// 终止工具：其失败会使 Agent 进入 ERROR
    #[serde(default = "default_terminal_tools")]
    pub terminal_tools: Vec<String>,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// 写入 Memory 的单条工具输出最大字符数
    #[serde(default = "default_max_observe_chars")]
    pub max_observe_chars: usize,
    /// 连续相同 thought 达到此数时追加一条换策略提示
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: usize,
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_agent_name() -> String {
    "agent".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_max_steps() -> usize {
    20
}

fn default_max_memory_messages() -> usize {
    100
}

fn default_tool_timeout_seconds() -> u64 {
    30
}

fn default_step_timeout_seconds() -> u64 {
    120
}

fn default_run_timeout_seconds() -> u64 {
    600
}

fn default_terminal_tools() -> Vec<String> {
    vec!["finish".to_string()]
}

fn default_max_concurrent_tools() -> usize {
    4
}

fn default_max_observe_chars() -> usize {
    10_000
}

fn default_duplicate_threshold() -> usize {
    2
}

fn default_cancel_grace_seconds() -> u64 {
    2
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            model: default_model(),
            provider: default_provider(),
            max_steps: default_max_steps(),
            max_memory_messages: default_max_memory_messages(),
            tool_timeout_seconds: default_tool_timeout_seconds(),
            step_timeout_seconds: default_step_timeout_seconds(),
            run_timeout_seconds: default_run_timeout_seconds(),
            enabled_tools: Vec::new(),
            terminal_tools: default_terminal_tools(),
            max_concurrent_tools: default_max_concurrent_tools(),
            max_observe_chars: default_max_observe_chars(),
            duplicate_threshold: default_duplicate_threshold(),
            cancel_grace_seconds: default_cancel_grace_seconds(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 所有数值参数必须为正
    pub fn validate(&self) -> Result<(), AgentError> {
        let checks: [(&str, u64); 8] = [
            ("max_steps", self.max_steps as u64),
            ("max_memory_messages", self.max_memory_messages as u64),
            ("tool_timeout_seconds", self.tool_timeout_seconds),
            ("step_timeout_seconds", self.step_timeout_seconds),
            ("run_timeout_seconds", self.run_timeout_seconds),
            ("max_concurrent_tools", self.max_concurrent_tools as u64),
            ("max_observe_chars", self.max_observe_chars as u64),
            ("duplicate_threshold", self.duplicate_threshold as u64),
        ];
        if let Some((key, _)) = checks.iter().find(|(_, v)| *v == 0) {
            return Err(AgentError::Config(format!("agent.{} must be positive", key)));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    pub fn is_terminal_tool(&self, name: &str) -> bool {
        self.terminal_tools.iter().any(|t| t == name)
    }
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

/// [mcp] 段：远程工具服务器列表（[[mcp.servers]]）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpSection {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// MCP 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    Stdio,
    Sse,
}

/// 单个 MCP 服务器
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportKind,
    /// stdio：要启动的命令
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// sse：POST 端点
    pub url: Option<String>,
    #[serde(default = "default_mcp_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
}

fn default_mcp_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_auto_reconnect() -> bool {
    true
}

impl McpServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            timeout_secs: default_mcp_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            auto_reconnect: default_auto_reconnect(),
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: McpTransportKind::Sse,
            command: None,
            url: Some(url.into()),
            ..Self::stdio(name, "", Vec::new())
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.timeout_secs == 0 || self.poll_interval_ms == 0 {
            return Err(AgentError::Config(format!(
                "mcp server '{}': timeout_secs and poll_interval_ms must be positive",
                self.name
            )));
        }
        match self.transport {
            McpTransportKind::Stdio if self.command.as_deref().unwrap_or("").is_empty() => Err(
                AgentError::Config(format!("mcp server '{}': stdio requires command", self.name)),
            ),
            McpTransportKind::Sse if self.url.as_deref().unwrap_or("").is_empty() => Err(
                AgentError::Config(format!("mcp server '{}': sse requires url", self.name)),
            ),
            _ => Ok(()),
        }
    }
}

/// [tools] 段：内置工具的白名单
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsSection {
    pub shell: ShellSection,
    pub browser: BrowserSection,
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellSection {
    #[serde(default = "crate::tools::shell::default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: crate::tools::shell::default_allowed_commands(),
        }
    }
}

/// [tools.browser] 段：可访问的域名与结果长度上限
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserSection {
    #[serde(default = "default_browser_domains")]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

fn default_browser_domains() -> Vec<String> {
    vec![
        "docs.rs".into(),
        "crates.io".into(),
        "doc.rust-lang.org".into(),
        "github.com".into(),
        "en.wikipedia.org".into(),
    ]
}

fn default_max_result_chars() -> usize {
    8000
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            allowed_domains: default_browser_domains(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        self.agent.validate()?;
        for server in &self.mcp.servers {
            server.validate()?;
        }
        Ok(())
    }

    /// 从 TOML 字符串解析（不读环境变量）
    pub fn from_toml_str(content: &str) -> Result<Self, AgentError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml));
        build(builder)
    }
}

const KNOWN_SECTIONS: &[&str] = &["agent", "llm", "mcp", "tools"];
/// [agent] 段可识别的键，由 AgentConfig 的序列化字段得出
pub fn known_agent_keys() -> Vec<String> {
    serde_json::to_value(AgentConfig::default())
        .ok()
        .and_then(|v| v.as_object().map(|o| o.keys().cloned().collect()))
        .unwrap_or_default()
}

/// agent 表（[agent] 或 Flow 阶段的 [stages.agent]）中未识别的键，按字母序
pub fn unknown_agent_keys(agent: &serde_json::Map<String, Value>) -> Vec<String> {
    let known = known_agent_keys();
    let mut unknown: Vec<String> = agent
        .keys()
        .filter(|k| !known.contains(k))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

/// 返回未识别的键（`section` 或 `agent.key`），并逐个 warn
pub fn unknown_keys(raw: &Value) -> Vec<String> {
    let mut unknown = Vec::new();
    let Some(root) = raw.as_object() else {
        return unknown;
    };
    for (section, body) in root {
        if !KNOWN_SECTIONS.contains(&section.as_str()) {
            unknown.push(section.clone());
            continue;
        }
        if section == "agent" {
            if let Some(agent) = body.as_object() {
                unknown.extend(
                    unknown_agent_keys(agent)
                        .into_iter()
                        .map(|k| format!("agent.{}", k)),
                );
            }
        }
    }
    unknown.sort();
    for key in &unknown {
        tracing::warn!(key = %key, "unknown configuration option ignored");
    }
    unknown
}

fn build(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<AppConfig, AgentError> {
    let c = builder
        .build()
        .map_err(|e| AgentError::Config(e.to_string()))?;
    if let Ok(raw) = c.clone().try_deserialize::<Value>() {
        unknown_keys(&raw);
    }
    let cfg: AppConfig = c
        .try_deserialize()
        .map_err(|e| AgentError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    build(builder)
}
