//! MCP 传输层：stdio（子进程 + NDJSON）与 SSE（HTTP POST + event-stream）
//!
//! 每次 request 分配自增 id，在 timeout 内等待同 id 的响应；超时返回 Timeout(Tool)，
//! 连接已断返回 TransportDisconnected，对端 JSON-RPC error 返回 Protocol。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::{McpServerConfig, McpTransportKind};
use crate::core::{AgentError, TimeoutScope};
use crate::mcp::protocol::{JsonRpcMessage, FRAMING_NDJSON, FRAMING_SSE};

impl McpTransportKind {
    /// 该传输使用的分帧版本（握手时与服务端核对）
    pub fn framing(self) -> &'static str {
        match self {
            McpTransportKind::Stdio => FRAMING_NDJSON,
            McpTransportKind::Sse => FRAMING_SSE,
        }
    }
}

/// 传输抽象：请求 / 通知 / 关闭 / 连接状态
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError>;

    async fn notify(&self, method: &str, params: Value) -> Result<(), AgentError>;

    async fn close(&self);

    fn is_connected(&self) -> bool;

    fn kind(&self) -> McpTransportKind;
}

/// 按配置建立传输
pub async fn connect_transport(
    config: &McpServerConfig,
) -> Result<Arc<dyn McpTransport>, AgentError> {
    match config.transport {
        McpTransportKind::Stdio => Ok(Arc::new(StdioTransport::spawn(config)?)),
        McpTransportKind::Sse => Ok(Arc::new(SseTransport::new(config)?)),
    }
}

fn map_rpc_error(response: JsonRpcMessage) -> Result<Value, AgentError> {
    response
        .into_result()
        .map_err(|e| AgentError::Protocol(format!("MCP error: {}", e)))
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcMessage>>>>;

/// stdio 传输：子进程 stdin 写请求，stdout 每行一个 JSON-RPC 消息
pub struct StdioTransport {
    server: String,
    write_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
    child: tokio::sync::Mutex<Child>,
    timeout: Duration,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig) -> Result<Self, AgentError> {
        let command = config
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AgentError::Config("stdio transport requires command".to_string()))?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::TransportDisconnected(format!("failed to spawn '{}': {}", command, e))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::TransportDisconnected("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::TransportDisconnected("child stdout unavailable".into()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let (write_tx, mut write_rx) = mpsc::channel::<String>(256);
        let alive_writer = Arc::clone(&alive);
        let server = config.name.clone();
        let server_writer = server.clone();
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                if !alive_writer.load(Ordering::SeqCst) {
                    break;
                }
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(server = %server_writer, error = %e, "mcp stdio write failed");
                    alive_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let pending_reader = Arc::clone(&pending);
        let alive_reader = Arc::clone(&alive);
        let server_reader = server.clone();
        let mut reader = BufReader::new(stdout);
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(&line) {
                            Ok(msg) if msg.is_response() => {
                                let waiter = msg.id_i64().and_then(|id| {
                                    pending_reader.lock().ok().and_then(|mut p| p.remove(&id))
                                });
                                if let Some(tx) = waiter {
                                    let _ = tx.send(msg);
                                }
                            }
                            Ok(msg) => {
                                tracing::debug!(server = %server_reader, method = ?msg.method, "mcp notification ignored");
                            }
                            Err(e) => {
                                tracing::warn!(server = %server_reader, error = %e, line = %line.trim(), "unparseable mcp message");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %server_reader, error = %e, "mcp stdio read failed");
                        break;
                    }
                }
            }
            alive_reader.store(false, Ordering::SeqCst);
            // 丢弃所有等待者，使其立即收到断开错误
            if let Ok(mut p) = pending_reader.lock() {
                p.clear();
            }
            tracing::info!(server = %server_reader, "mcp stdio stream closed");
        });

        Ok(Self {
            server,
            write_tx,
            pending,
            next_id: AtomicI64::new(1),
            alive,
            child: tokio::sync::Mutex::new(child),
            timeout: config.timeout(),
        })
    }

    fn disconnected(&self) -> AgentError {
        AgentError::TransportDisconnected(self.server.clone())
    }

    fn forget(&self, id: i64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.is_connected() {
            return Err(self.disconnected());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcMessage::request(id, method, params))
            .map_err(|e| AgentError::Protocol(e.to_string()))?
            + "\n";

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| self.disconnected())?
            .insert(id, tx);

        if self.write_tx.send(line).await.is_err() {
            self.forget(id);
            return Err(self.disconnected());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => map_rpc_error(response),
            Ok(Err(_)) => Err(self.disconnected()),
            Err(_) => {
                self.forget(id);
                Err(AgentError::Timeout(TimeoutScope::Tool))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Err(self.disconnected());
        }
        let line = serde_json::to_string(&JsonRpcMessage::notification(method, params))
            .map_err(|e| AgentError::Protocol(e.to_string()))?
            + "\n";
        self.write_tx
            .send(line)
            .await
            .map_err(|_| self.disconnected())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Ok(mut p) = self.pending.lock() {
            p.clear();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!(server = %self.server, error = %e, "mcp child already exited");
        }
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Stdio
    }
}

/// SSE 传输：每个请求一次 HTTP POST；响应为 application/json 或 text/event-stream
pub struct SseTransport {
    server: String,
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicI64,
    alive: AtomicBool,
    session_header: Mutex<Option<String>>,
    timeout: Duration,
}

const SESSION_HEADER: &str = "mcp-session-id";

impl SseTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self, AgentError> {
        let endpoint = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AgentError::Config("sse transport requires url".to_string()))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            server: config.name.clone(),
            endpoint,
            client,
            next_id: AtomicI64::new(1),
            alive: AtomicBool::new(true),
            session_header: Mutex::new(None),
            timeout: config.timeout(),
        })
    }

    fn disconnected(&self) -> AgentError {
        AgentError::TransportDisconnected(self.server.clone())
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<reqwest::Response, AgentError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(message);
        let session = self.session_header.lock().ok().and_then(|s| s.clone());
        if let Some(session) = session {
            req = req.header(SESSION_HEADER, session);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(server = %self.server, error = %e, "mcp sse post failed");
            self.alive.store(false, Ordering::SeqCst);
            self.disconnected()
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_header.lock() {
                *slot = Some(session.to_string());
            }
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Protocol(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn exchange(&self, id: i64, message: JsonRpcMessage) -> Result<Value, AgentError> {
        let response = self.post(&message).await?;
        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        if !is_stream {
            let msg: JsonRpcMessage = response
                .json()
                .await
                .map_err(|e| AgentError::Protocol(format!("invalid JSON response: {}", e)))?;
            return map_rpc_error(msg);
        }

        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::warn!(server = %self.server, error = %e, "mcp sse stream broken");
                self.alive.store(false, Ordering::SeqCst);
                self.disconnected()
            })?;
            for data in parser.feed(&chunk) {
                match serde_json::from_str::<JsonRpcMessage>(&data) {
                    Ok(msg) if msg.is_response() && msg.id_i64() == Some(id) => {
                        return map_rpc_error(msg);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(server = %self.server, error = %e, "unparseable sse event");
                    }
                }
            }
        }
        Err(AgentError::Protocol(format!(
            "event stream ended without a response to request {}",
            id
        )))
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.is_connected() {
            return Err(self.disconnected());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcMessage::request(id, method, params);
        match tokio::time::timeout(self.timeout, self.exchange(id, message)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(TimeoutScope::Tool)),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Err(self.disconnected());
        }
        let message = JsonRpcMessage::notification(method, params);
        tokio::time::timeout(self.timeout, self.post(&message))
            .await
            .map_err(|_| AgentError::Timeout(TimeoutScope::Tool))??;
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Sse
    }
}

/// 增量解析 event-stream：按空行切分事件，拼接多行 data:
///
/// 按字节缓冲，只解码完整的行，网络分块切在多字节字符中间时不会损坏内容。
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    /// 喂入一段字节，返回本次完成的事件 data
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_splits_events_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: message\ndata: {\"a\":").is_empty());
        let events = parser.feed(b"1}\n\ndata: two\ndata: lines\n\n: comment\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "two\nlines".to_string()]);
    }

    #[test]
    fn test_sse_parser_handles_crlf() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"data: x\r\n\r\n");
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[test]
    fn test_sse_parser_keeps_multibyte_chars_split_across_chunks() {
        let payload = "data: {\"text\":\"café 你好\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut parser = SseParser::default();
        assert!(parser.feed(&payload[..split]).is_empty());
        let events = parser.feed(&payload[split..]);
        assert_eq!(events, vec!["{\"text\":\"café 你好\"}".to_string()]);
        assert!(!events[0].contains('\u{FFFD}'));
    }

    #[test]
    fn test_sse_parser_byte_at_a_time() {
        let payload = "data: 你好\n\n".as_bytes();
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        for b in payload {
            events.extend(parser.feed(std::slice::from_ref(b)));
        }
        assert_eq!(events, vec!["你好".to_string()]);
    }

    #[test]
    fn test_framing_per_kind() {
        assert_eq!(McpTransportKind::Stdio.framing(), FRAMING_NDJSON);
        assert_eq!(McpTransportKind::Sse.framing(), FRAMING_SSE);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_disconnected() {
        let config = McpServerConfig::stdio("ghost", "/definitely/not/a/binary", vec![]);
        match StdioTransport::spawn(&config) {
            Err(AgentError::TransportDisconnected(msg)) => assert!(msg.contains("failed to spawn")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
