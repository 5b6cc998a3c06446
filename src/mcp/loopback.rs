//! 进程内传输：直接调用同进程的 McpServer，不经过子进程或网络
//!
//! 用于把本地工具集以 MCP 会话的形式挂到 Agent 上，以及在不启动子进程的情况下演练断线与重连。

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::McpTransportKind;
use crate::core::{AgentError, TimeoutScope};
use crate::mcp::protocol::JsonRpcMessage;
use crate::mcp::server::McpServer;
use crate::mcp::transport::McpTransport;

pub struct LoopbackTransport {
    server: Arc<McpServer>,
    connected: Arc<AtomicBool>,
    next_id: AtomicI64,
    timeout: Duration,
}

/// 外部断开句柄：模拟对端进程退出
#[derive(Clone, Debug)]
pub struct LoopbackHandle {
    connected: Arc<AtomicBool>,
}

impl LoopbackHandle {
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl LoopbackTransport {
    pub fn new(server: Arc<McpServer>, timeout: Duration) -> Self {
        Self {
            server,
            connected: Arc::new(AtomicBool::new(true)),
            next_id: AtomicI64::new(1),
            timeout,
        }
    }

    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            connected: Arc::clone(&self.connected),
        }
    }
}

#[async_trait]
impl McpTransport for LoopbackTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.is_connected() {
            return Err(AgentError::TransportDisconnected("loopback".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcMessage::request(id, method, params);
        let reply = tokio::time::timeout(self.timeout, self.server.handle(message))
            .await
            .map_err(|_| AgentError::Timeout(TimeoutScope::Tool))?
            .ok_or_else(|| AgentError::Protocol(format!("no reply to {}", method)))?;
        if !self.is_connected() {
            return Err(AgentError::TransportDisconnected("loopback".to_string()));
        }
        reply
            .into_result()
            .map_err(|e| AgentError::Protocol(format!("MCP error: {}", e)))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Err(AgentError::TransportDisconnected("loopback".to_string()));
        }
        self.server
            .handle(JsonRpcMessage::notification(method, params))
            .await;
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Stdio
    }
}
