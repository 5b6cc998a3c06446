pub mod echo;
pub mod executor;
pub mod finish;
pub mod registry;
pub mod schema;
pub mod shell;

#[cfg(feature = "browser")]
pub mod browser;

pub use echo::EchoTool;
pub use executor::{ToolExecutor, ToolInvocation, ToolOutcome};
pub use finish::{FinishTool, FINISH_TOOL};
pub use registry::{Tool, ToolCollection, ToolResult};
pub use schema::{intent_schema_json, schema_of, validate_args};
pub use shell::ShellTool;

#[cfg(feature = "browser")]
pub use browser::BrowserTool;

/// 内置工具集：echo、finish、shell
pub fn builtin_tools() -> ToolCollection {
    let mut tools = ToolCollection::new();
    let _ = tools.register(EchoTool);
    let _ = tools.register(FinishTool);
    let _ = tools.register(ShellTool::default());
    tools
}
