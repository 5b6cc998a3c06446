//! finish 工具：结束 Agent 的步循环
//!
//! 返回 is_terminal 的结果，output 作为 run 的最终输出。默认被配置为终止工具，
//! 它自身失败（参数错误等）会使 Agent 进入 ERROR。

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_of, Tool, ToolResult};

pub const FINISH_TOOL: &str = "finish";

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct FinishArgs {
    /// 交给调用方的最终答复
    output: String,
}

pub struct FinishTool;

#[async_trait]
impl Tool for FinishTool {
    fn name(&self) -> &str {
        FINISH_TOOL
    }

    fn description(&self) -> &str {
        "Finish the task and return the final answer. Call this once the request is fully handled. Args: {\"output\": \"final answer\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<FinishArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let args: FinishArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(ToolResult::terminal(args.output))
    }
}
