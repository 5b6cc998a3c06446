//! 可观测性：tracing 订阅器初始化
//!
//! 日志写到 stderr，保证 `hive mcp-serve` 的 stdout 只承载协议帧。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    init_with_default("info");
}

pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
