//! MCP 服务端：把一个 ToolCollection 以 MCP 协议暴露出去
//!
//! `hive mcp-serve` 用它在 stdin/stdout 上按行收发 JSON-RPC；LoopbackTransport 在进程内直接调用 handle。
//! 每个请求独立 spawn，慢工具不会阻塞同一连接上的其它请求。

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::core::AgentError;
use crate::mcp::protocol::{
    CallToolParams, CallToolResult, ContentBlock, Implementation, InitializeParams, InitializeResult,
    JsonRpcMessage, ListToolsResult, ToolManifestEntry, ERROR_INVALID_PARAMS,
    ERROR_METHOD_NOT_FOUND, ERROR_PARSE, FRAMING_NDJSON, FRAMING_SSE, METHOD_INITIALIZE, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};
use crate::tools::ToolCollection;

pub struct McpServer {
    tools: ToolCollection,
    info: Implementation,
}

impl McpServer {
    pub fn new(tools: ToolCollection) -> Self {
        Self {
            tools,
            info: Implementation::hive(),
        }
    }

    pub fn tools(&self) -> &ToolCollection {
        &self.tools
    }

    fn manifest(&self) -> Vec<ToolManifestEntry> {
        self.tools
            .iter()
            .filter(|(_, t)| t.is_available())
            .map(|(name, tool)| ToolManifestEntry {
                name: name.to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }

    /// 处理一条消息；通知与响应不回复（返回 None）
    pub async fn handle(&self, msg: JsonRpcMessage) -> Option<JsonRpcMessage> {
        let id = msg.id.clone()?;
        let method = msg.method.as_deref()?;
        let params = msg.params.clone().unwrap_or(Value::Null);

        let reply = match method {
            METHOD_INITIALIZE => {
                let requested = serde_json::from_value::<InitializeParams>(params)
                    .ok()
                    .and_then(|p| p.framing);
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: json!({"tools": {"listChanged": false}}),
                    server_info: self.info.clone(),
                    framing: Some(negotiate_framing(requested.as_deref()).to_string()),
                };
                to_response(id, &result)
            }
            METHOD_PING => JsonRpcMessage::response(id, json!({})),
            METHOD_TOOLS_LIST => to_response(
                id,
                &ListToolsResult {
                    tools: self.manifest(),
                },
            ),
            METHOD_TOOLS_CALL => self.call(id, params).await,
            other => JsonRpcMessage::error_response(
                id,
                ERROR_METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            ),
        };
        Some(reply)
    }

    async fn call(&self, id: Value, params: Value) -> JsonRpcMessage {
        let params: CallToolParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcMessage::error_response(id, ERROR_INVALID_PARAMS, e.to_string())
            }
        };
        tracing::debug!(tool = %params.name, "mcp tools/call");
        match self.tools.dispatch(&params.name, params.arguments).await {
            Ok(result) => to_response(id, &CallToolResult::from_tool_result(&result)),
            Err(e @ AgentError::ToolNotFound(_)) => {
                JsonRpcMessage::error_response(id, ERROR_INVALID_PARAMS, e.to_string())
            }
            Err(e) => to_response(
                id,
                &CallToolResult {
                    content: vec![ContentBlock::text(e.to_string())],
                    is_error: true,
                    is_terminal: false,
                    structured_content: None,
                },
            ),
        }
    }

    /// 按行读取请求、按行写回响应，直到输入结束
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut lines = reader.lines();
        let mut in_flight = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let msg = match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(m) => m,
                Err(e) => {
                    let reply = JsonRpcMessage::error_response(Value::Null, ERROR_PARSE, e.to_string());
                    let _ = out_tx.send(encode_line(&reply));
                    continue;
                }
            };
            let server = Arc::clone(&self);
            let out = out_tx.clone();
            in_flight.push(tokio::spawn(async move {
                if let Some(reply) = server.handle(msg).await {
                    let _ = out.send(encode_line(&reply));
                }
            }));
            in_flight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());
        }

        for handle in in_flight {
            let _ = handle.await;
        }
        drop(out_tx);
        writer_task.await??;
        tracing::info!("mcp server input closed");
        Ok(())
    }

    pub async fn serve_stdio(self: Arc<Self>) -> anyhow::Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }
}

/// 客户端请求受支持的分帧时照用，否则回落到按行 JSON
fn negotiate_framing(requested: Option<&str>) -> &'static str {
    match requested {
        Some(FRAMING_SSE) => FRAMING_SSE,
        _ => FRAMING_NDJSON,
    }
}

fn to_response<T: serde::Serialize>(id: Value, result: &T) -> JsonRpcMessage {
    match serde_json::to_value(result) {
        Ok(v) => JsonRpcMessage::response(id, v),
        Err(e) => JsonRpcMessage::error_response(id, ERROR_PARSE, e.to_string()),
    }
}

fn encode_line(msg: &JsonRpcMessage) -> String {
    serde_json::to_string(msg).unwrap_or_default() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FinishTool};

    fn server() -> McpServer {
        let mut tools = ToolCollection::new();
        tools.register(EchoTool).unwrap();
        tools.register(FinishTool).unwrap();
        McpServer::new(tools)
    }

    #[tokio::test]
    async fn test_tools_list_is_sorted_manifest() {
        let reply = server()
            .handle(JsonRpcMessage::request(1, METHOD_TOOLS_LIST, json!({})))
            .await
            .unwrap();
        let list: ListToolsResult = serde_json::from_value(reply.into_result().unwrap()).unwrap();
        let names: Vec<&str> = list.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "finish"]);
        assert_eq!(list.tools[0].input_schema["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn test_call_maps_errors() {
        let server = server();
        let ok = server
            .handle(JsonRpcMessage::request(
                2,
                METHOD_TOOLS_CALL,
                json!({"name": "echo", "arguments": {"text": "hi"}}),
            ))
            .await
            .unwrap();
        let result: CallToolResult = serde_json::from_value(ok.into_result().unwrap()).unwrap();
        assert_eq!(result.content[0].text.as_deref(), Some("hi"));

        let invalid = server
            .handle(JsonRpcMessage::request(
                3,
                METHOD_TOOLS_CALL,
                json!({"name": "echo", "arguments": {}}),
            ))
            .await
            .unwrap();
        let result: CallToolResult = serde_json::from_value(invalid.into_result().unwrap()).unwrap();
        assert!(result.is_error);

        let missing = server
            .handle(JsonRpcMessage::request(
                4,
                METHOD_TOOLS_CALL,
                json!({"name": "ghost", "arguments": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.into_result().unwrap_err().code, ERROR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let reply = server()
            .handle(JsonRpcMessage::notification("notifications/initialized", json!({})))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_serve_over_ndjson() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","clientInfo":{"name":"t","version":"0"}}}"#,
            "\n",
            "not json\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"bogus"}"#,
            "\n",
        );
        let (client, server_end) = tokio::io::duplex(64 * 1024);
        let reader = tokio::io::BufReader::new(input.as_bytes());
        Arc::new(server()).serve(reader, server_end).await.unwrap();

        let mut out = String::new();
        let mut client = tokio::io::BufReader::new(client);
        use tokio::io::AsyncReadExt;
        client.read_to_string(&mut out).await.unwrap();
        let replies: Vec<JsonRpcMessage> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 3);
        assert!(replies
            .iter()
            .any(|r| r.error.as_ref().map(|e| e.code) == Some(ERROR_PARSE)));
        assert!(replies
            .iter()
            .any(|r| r.error.as_ref().map(|e| e.code) == Some(ERROR_METHOD_NOT_FOUND)));
        let init = replies.iter().find(|r| r.id_i64() == Some(1)).unwrap();
        assert_eq!(init.result.as_ref().unwrap()["framing"], FRAMING_NDJSON);
    }

    #[tokio::test]
    async fn test_initialize_echoes_sse_framing() {
        let reply = server()
            .handle(JsonRpcMessage::request(
                1,
                METHOD_INITIALIZE,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {"name": "t", "version": "0"},
                    "framing": FRAMING_SSE
                }),
            ))
            .await
            .unwrap();
        assert_eq!(reply.into_result().unwrap()["framing"], FRAMING_SSE);
    }
}
