//! 远程工具代理：把 MCP 会话中的一个工具包装成本地 Tool
//!
//! 代理绑定创建它的会话；会话断开后 is_available 返回 false，ToolCollection 视其为不存在。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::mcp::protocol::ToolManifestEntry;
use crate::mcp::session::McpSession;
use crate::tools::{Tool, ToolResult};

pub struct McpProxyTool {
    session: Arc<McpSession>,
    entry: ToolManifestEntry,
}

impl McpProxyTool {
    pub fn new(session: Arc<McpSession>, entry: ToolManifestEntry) -> Self {
        Self { session, entry }
    }

    /// 为会话清单中的每个工具生成一个代理
    pub fn for_session(session: &Arc<McpSession>) -> Vec<Arc<dyn Tool>> {
        session
            .tools()
            .iter()
            .map(|entry| {
                Arc::new(McpProxyTool::new(Arc::clone(session), entry.clone())) as Arc<dyn Tool>
            })
            .collect()
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn description(&self) -> &str {
        &self.entry.description
    }

    fn parameters_schema(&self) -> Value {
        self.entry.input_schema.clone()
    }

    fn is_available(&self) -> bool {
        self.session.is_alive()
    }

    fn origin(&self) -> Option<&str> {
        Some(self.session.id())
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        self.session
            .call_tool(&self.entry.name, args)
            .await
            .map_err(|e| e.to_string())
    }
}
