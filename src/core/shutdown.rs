//! 优雅关闭处理
//!
//! 统一监听 Ctrl+C / SIGTERM，触发后取消 token：正在运行的 Agent / Flow 停止发起新的工具调用，
//! 在宽限期内等待进行中的调用，随后以 Cancelled 进入 ERROR。

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    /// 首个触发关闭的原因
    reason: Mutex<Option<ShutdownReason>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "Ctrl+C"),
            ShutdownReason::Terminate => write!(f, "SIGTERM"),
        }
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取关闭 token（交给 Agent / Flow 作为外部取消源）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        tracing::info!(reason = %reason, "shutdown requested, cancelling running agents");
        self.token.cancel();
    }

    /// 已触发关闭时返回原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| *slot)
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        assert_eq!(manager.reason(), None);
        manager.shutdown(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Interrupt));
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        manager.shutdown(ShutdownReason::Terminate);
        manager.shutdown(ShutdownReason::Interrupt);
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
        assert_eq!(ShutdownReason::Terminate.to_string(), "SIGTERM");
    }
}
