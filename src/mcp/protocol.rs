//! MCP 线上格式：JSON-RPC 2.0 消息与 initialize / tools/list / tools/call 的载荷
//!
//! 同一个 JsonRpcMessage 结构同时承载请求、通知与响应，stdio 与 SSE 两种传输共用。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolResult;

pub const JSONRPC_VERSION: &str = "2.0";
/// 本端使用的 MCP 协议版本
pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// 握手时接受的服务端协议版本
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// stdio 分帧：每行一个 JSON-RPC 消息
pub const FRAMING_NDJSON: &str = "hive-ndjson/1";
/// SSE 分帧：POST 请求，响应为 JSON 或 text/event-stream 的 data: 事件
pub const FRAMING_SSE: &str = "hive-sse/1";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// 请求 / 通知 / 响应共用的消息结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    pub fn request(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            ..Default::default()
        }
    }

    /// 没有 method 的消息是响应
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    pub fn id_i64(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    /// 响应转结果：error 字段优先
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn hive() -> Self {
        Self {
            name: "hive".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: Implementation,
    /// 客户端期望的分帧版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<String>,
}

/// tools/list 返回的单个工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolManifestEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// 内容块；只解析 text，其它类型保留 type 以便日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// tools/call 的结果；isTerminal 是 hive 的扩展字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    pub fn from_tool_result(result: &ToolResult) -> Self {
        let structured_content = match &result.output {
            Value::String(_) | Value::Null => None,
            other => Some(other.clone()),
        };
        Self {
            content: vec![ContentBlock::text(result.to_observation())],
            is_error: result.is_error(),
            is_terminal: result.is_terminal,
            structured_content,
        }
    }

    fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn into_tool_result(self) -> ToolResult {
        if self.is_error {
            let text = self.joined_text();
            return ToolResult::failure(text.strip_prefix("Error: ").unwrap_or(&text).to_string());
        }
        let output = match self.structured_content.clone() {
            Some(v) => v,
            None => Value::String(self.joined_text()),
        };
        ToolResult {
            output,
            error: None,
            is_terminal: self.is_terminal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let msg = JsonRpcMessage::request(7, METHOD_TOOLS_CALL, json!({"name": "echo"}));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {"name": "echo"}})
        );
        assert!(!msg.is_response());
    }

    #[test]
    fn test_error_response_into_result() {
        let line = r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#;
        let msg: JsonRpcMessage = serde_json::from_str(line).unwrap();
        assert!(msg.is_response());
        assert_eq!(msg.id_i64(), Some(3));
        assert_eq!(msg.into_result().unwrap_err().code, ERROR_METHOD_NOT_FOUND);
    }

    #[test]
    fn test_manifest_defaults() {
        let entry: ToolManifestEntry = serde_json::from_value(json!({"name": "x"})).unwrap();
        assert_eq!(entry.input_schema["type"], "object");
    }

    #[test]
    fn test_call_result_conversion() {
        let terminal = CallToolResult::from_tool_result(&ToolResult::terminal("bye"));
        assert!(terminal.is_terminal);
        let back = terminal.into_tool_result();
        assert_eq!(back, ToolResult::terminal("bye"));

        let failed = CallToolResult::from_tool_result(&ToolResult::failure("boom"));
        assert!(failed.is_error);
        assert_eq!(failed.into_tool_result().error.as_deref(), Some("boom"));

        let structured = CallToolResult::from_tool_result(&ToolResult::json(json!({"n": 1})));
        assert_eq!(structured.into_tool_result().output, json!({"n": 1}));
    }
}
