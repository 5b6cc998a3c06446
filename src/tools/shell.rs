//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cat）；禁止 rm -rf、wget、chmod 777 等子串；
//! 执行通过 sh -c / cmd /C，带超时与 tracing 审计。非零退出码作为工具失败返回。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::{schema_of, Tool, ToolResult};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

pub fn default_allowed_commands() -> Vec<String> {
    ["ls", "cat", "head", "tail", "wc", "grep", "find", "echo", "pwd", "date"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ShellArgs {
    /// 要执行的命令（首词必须在白名单内）
    command: String,
}

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, timeout: Duration) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            timeout,
        }
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {}", forbidden));
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new(default_allowed_commands(), Duration::from_secs(30))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command and return stdout, stderr and exit code. Args: {\"command\": \"ls -la\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ShellArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let args: ShellArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let command = args.command.trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!(
                "Exit {}\nstderr: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(ToolResult::json(serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": output.status.code().unwrap_or(0),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_forbidden_patterns_rejected() {
        let tool = ShellTool::default();
        assert!(tool.is_allowed("ls -la").is_ok());
        assert!(tool.is_allowed("rm -rf /").unwrap_err().contains("Forbidden"));
        assert!(tool.is_allowed("python3 x.py").unwrap_err().contains("allowlist"));
        assert!(tool.is_allowed("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_runs() {
        let tool = ShellTool::default();
        let result = tool.execute(json!({"command": "echo hive"})).await.unwrap();
        assert_eq!(result.output["stdout"].as_str().unwrap().trim(), "hive");
        assert_eq!(result.output["exit_code"], json!(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let tool = ShellTool::default();
        let err = tool
            .execute(json!({"command": "ls /definitely/not/here"}))
            .await
            .unwrap_err();
        assert!(err.starts_with("Exit "), "{err}");
    }
}
