use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Hive - 状态机驱动的智能体编排运行时
#[derive(Parser, Debug, Clone)]
#[command(name = "hive", version, about, long_about = None)]
pub struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, env = "HIVE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// 使用 Mock LLM（无需 API Key）
    #[arg(long, global = true)]
    pub mock: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// 运行单个 Agent 处理一个请求
    Run {
        /// 请求文本
        request: String,
        /// 将完整 Memory 轨迹写入该 JSON 文件
        #[arg(long)]
        trace_out: Option<PathBuf>,
    },
    /// 按定义文件运行多阶段 Flow
    Flow {
        /// Flow 定义文件（TOML）
        file: PathBuf,
        /// 第一个阶段的输入
        #[arg(short, long)]
        input: Option<String>,
        /// 将阶段审计写入该 JSON 文件
        #[arg(long)]
        audit_out: Option<PathBuf>,
    },
    /// 在 stdin/stdout 上以 MCP 协议暴露内置工具
    McpServe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_run() {
        let cli = Cli::parse_from(["hive", "--mock", "run", "hello"]);
        assert!(cli.mock);
        assert!(cli.config.is_none());
        match cli.command {
            Command::Run { request, trace_out } => {
                assert_eq!(request, "hello");
                assert!(trace_out.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_flow_with_args() {
        let cli = Cli::parse_from([
            "hive",
            "flow",
            "demos/flow.toml",
            "--input",
            "rust",
            "--config",
            "custom.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Command::Flow { file, input, audit_out } => {
                assert_eq!(file, PathBuf::from("demos/flow.toml"));
                assert_eq!(input.as_deref(), Some("rust"));
                assert!(audit_out.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_mcp_serve() {
        let cli = Cli::parse_from(["hive", "mcp-serve"]);
        assert!(matches!(cli.command, Command::McpServe));
    }
}
