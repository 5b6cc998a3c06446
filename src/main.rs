//! Hive 命令行入口
//!
//! `run` 运行单个 Agent，`flow` 按定义文件运行多阶段 Flow，`mcp-serve` 在 stdio 上暴露内置工具。
//! Ctrl+C / SIGTERM 会取消正在运行的 Agent 或 Flow。

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use hive::bootstrap::{build_agent, build_llm, build_tools, ConfigAgentFactory};
use hive::cli::{Cli, Command};
use hive::core::ShutdownManager;
use hive::flow::{FlowBuilder, FlowContext, FlowDefinition, FlowError};
use hive::mcp::McpServer;
use hive::memory::TracePersistence;
use hive::react::AgentEvent;
use hive::{load_config, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let app = load_config(cli.config.clone()).context("Failed to load config")?;
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    match cli.command {
        Command::Run { request, trace_out } => {
            let llm = build_llm(&app, &app.agent, cli.mock);
            let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
            let agent = build_agent(&app, app.agent.clone(), llm)
                .context("Failed to build agent")?
                .with_events(tx)
                .with_cancel_token(shutdown.token());

            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        tracing::debug!(event = %line, "agent event");
                    }
                }
            });

            let result = agent.run(&request).await;
            drop(agent);
            let _ = printer.await;

            match result {
                Ok(out) => {
                    if let Some(path) = trace_out {
                        TracePersistence::new(&path)
                            .save(&out.trace)
                            .with_context(|| format!("Failed to write trace to {}", path.display()))?;
                    }
                    tracing::info!(steps = out.steps, reason = ?out.reason, "done");
                    println!("{}", out.output);
                }
                Err(failure) => {
                    if let Some(path) = trace_out {
                        TracePersistence::new(&path).save(&failure.trace)?;
                    }
                    if let Some(reason) = shutdown.reason() {
                        return Err(failure).with_context(|| format!("Agent run cancelled by {}", reason));
                    }
                    return Err(failure).context("Agent run failed");
                }
            }
        }
        Command::Flow {
            file,
            input,
            audit_out,
        } => {
            let def = FlowDefinition::from_file(&file)?;
            let flow = FlowBuilder::from_definition(def)
                .factory(ConfigAgentFactory::new(app.clone(), cli.mock))
                .cancel_token(shutdown.token())
                .build()?;
            let initial = input.map(FlowContext::with_input).unwrap_or_default();

            match flow.run_flow(initial).await {
                Ok(outcome) => {
                    if let Some(path) = audit_out {
                        TracePersistence::new(&path).save_json(&outcome.audit)?;
                    }
                    for (key, value) in outcome.context.iter() {
                        println!("{}: {}", key, hive::flow::types::render_value(value));
                    }
                }
                Err(FlowError::StageFailed {
                    stage,
                    index,
                    error,
                    audit,
                    failed_trace,
                }) => {
                    if let Some(path) = audit_out {
                        TracePersistence::new(&path).save_json(&serde_json::json!({
                            "completed": audit,
                            "failed_stage": stage,
                            "failed_trace": failed_trace,
                        }))?;
                    }
                    if let Some(reason) = shutdown.reason() {
                        tracing::warn!(reason = %reason, "flow cancelled by signal");
                    }
                    anyhow::bail!("Flow halted at stage '{}' (#{}): {}", stage, index, error);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::McpServe => {
            let tools = build_tools(&app, &app.agent)?;
            tracing::info!(tools = ?tools.names(), "serving tools over stdio");
            let server = Arc::new(McpServer::new(tools));
            let stop = shutdown.token();
            tokio::select! {
                r = server.serve_stdio() => r?,
                _ = stop.cancelled() => {}
            }
        }
    }

    if let Some(reason) = shutdown.reason() {
        tracing::info!(reason = %reason, "stopped by signal");
    }
    Ok(())
}
