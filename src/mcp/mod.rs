//! MCP 远程工具：协议、传输、会话、客户端监管、代理工具与服务端

pub mod client;
pub mod loopback;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{ConfigConnector, McpClient, McpConnector, ReconnectPolicy};
pub use loopback::{LoopbackHandle, LoopbackTransport};
pub use protocol::{CallToolResult, JsonRpcMessage, ToolManifestEntry, PROTOCOL_VERSION};
pub use proxy::McpProxyTool;
pub use server::McpServer;
pub use session::{McpSession, MAX_CONSECUTIVE_TIMEOUTS};
pub use transport::{connect_transport, McpTransport, SseTransport, StdioTransport};
