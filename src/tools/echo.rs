//! Echo 工具（测试与演示用）

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_of, Tool, ToolResult};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let args: EchoArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(ToolResult::text(args.text))
    }
}
