//! MCP 会话：一次成功握手后的连接实例
//!
//! 会话 id 在创建时生成，断开即作废；重连总是产生新的会话与新的代理工具。
//! 连续 3 次调用超时视为连接失效，会话主动关闭并交给 McpClient 的监管任务重连。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::AgentError;
use crate::mcp::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, ToolManifestEntry, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::transport::McpTransport;
use crate::tools::ToolResult;

/// 连续超时达到此数时强制断开
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

pub struct McpSession {
    id: String,
    server: String,
    transport: Arc<dyn McpTransport>,
    server_info: Implementation,
    tools: Vec<ToolManifestEntry>,
    closed: AtomicBool,
    consecutive_timeouts: AtomicU32,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("tools", &self.tool_names())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl McpSession {
    /// 握手：initialize -> notifications/initialized -> tools/list
    pub async fn open(
        server: impl Into<String>,
        transport: Arc<dyn McpTransport>,
    ) -> Result<Arc<Self>, AgentError> {
        let server = server.into();
        let framing = transport.kind().framing();
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation::hive(),
            framing: Some(framing.to_string()),
        };
        let params = serde_json::to_value(&params).map_err(|e| AgentError::Protocol(e.to_string()))?;

        let handshake = async {
            let raw = transport.request(METHOD_INITIALIZE, params).await?;
            let init: InitializeResult = serde_json::from_value(raw)
                .map_err(|e| AgentError::Protocol(format!("invalid initialize result: {}", e)))?;
            check_versions(&init, framing)?;

            transport.notify(METHOD_INITIALIZED, json!({})).await?;

            let raw = transport.request(METHOD_TOOLS_LIST, json!({})).await?;
            let list: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| AgentError::Protocol(format!("invalid tools/list result: {}", e)))?;
            Ok::<_, AgentError>((init, list))
        };

        let (init, list) = match handshake.await {
            Ok(v) => v,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            server,
            transport,
            server_info: init.server_info,
            tools: list.tools,
            closed: AtomicBool::new(false),
            consecutive_timeouts: AtomicU32::new(0),
        });
        tracing::info!(
            server = %session.server,
            session = %session.id,
            remote = %session.server_info.name,
            tools = ?session.tool_names(),
            "mcp session established"
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    /// 远端工具清单（保持服务端返回的顺序）
    pub fn tools(&self) -> &[ToolManifestEntry] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    /// 传输仍连接且会话未被关闭
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, AgentError> {
        if !self.is_alive() {
            return Err(AgentError::TransportDisconnected(self.server.clone()));
        }
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })
        .map_err(|e| AgentError::Protocol(e.to_string()))?;

        let mut in_flight = InFlightCall {
            session: self,
            tool: name,
            settled: false,
        };
        let outcome = self.transport.request(METHOD_TOOLS_CALL, params).await;
        in_flight.settled = true;

        match outcome {
            Ok(raw) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                let result: CallToolResult = serde_json::from_value(raw)
                    .map_err(|e| AgentError::Protocol(format!("invalid tools/call result: {}", e)))?;
                Ok(result.into_tool_result())
            }
            Err(AgentError::Timeout(scope)) => {
                self.record_timeout(name);
                Err(AgentError::Timeout(scope))
            }
            Err(e @ AgentError::TransportDisconnected(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 当前连续超时次数
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    fn record_timeout(&self, tool: &str) {
        let n = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(server = %self.server, session = %self.id, tool = %tool, consecutive = n, "mcp call timed out");
        if n >= MAX_CONSECUTIVE_TIMEOUTS {
            tracing::warn!(server = %self.server, session = %self.id, "too many consecutive timeouts, dropping session");
            self.force_close();
        }
    }

    /// 同步置为关闭，传输的关闭放到后台任务（可能在 Drop 中调用）
    fn force_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { transport.close().await });
            }
            Err(_) => tracing::warn!(server = %self.server, "no runtime to close mcp transport"),
        }
        tracing::info!(server = %self.server, session = %self.id, "mcp session closed");
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.transport.close().await;
            tracing::info!(server = %self.server, session = %self.id, "mcp session closed");
        }
    }
}

/// 进行中的 tools/call；未得到结果就被丢弃（外层 tool_timeout 先到期）时按一次超时计数
struct InFlightCall<'a> {
    session: &'a McpSession,
    tool: &'a str,
    settled: bool,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.session.record_timeout(self.tool);
        }
    }
}

fn check_versions(init: &InitializeResult, framing: &str) -> Result<(), AgentError> {
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
        return Err(AgentError::Protocol(format!(
            "unsupported protocol version {}",
            init.protocol_version
        )));
    }
    match init.framing.as_deref() {
        Some(f) if f != framing => Err(AgentError::Protocol(format!(
            "unsupported framing {} (expected {})",
            f, framing
        ))),
        _ => Ok(()),
    }
}
