//! MCP 客户端：管理到一个服务器的会话生命周期
//!
//! 首次 connect 建立会话并启动监管任务；监管任务按 poll_interval 检查会话存活，
//! 断开后关闭旧会话并按指数退避重连（最多 max_reconnect_attempts 次），超出预算后保持断开。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::McpServerConfig;
use crate::core::AgentError;
use crate::mcp::proxy::McpProxyTool;
use crate::mcp::session::McpSession;
use crate::mcp::transport::{connect_transport, McpTransport};
use crate::tools::Tool;

/// 传输工厂：每次（重）连调用一次
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn McpTransport>, AgentError>;
}

/// 按配置建立 stdio / SSE 传输
pub struct ConfigConnector {
    config: McpServerConfig,
}

impl ConfigConnector {
    pub fn new(config: McpServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl McpConnector for ConfigConnector {
    async fn connect(&self) -> Result<Arc<dyn McpTransport>, AgentError> {
        connect_transport(&self.config).await
    }
}

/// 断线检测与重连策略
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub auto_reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 3,
            auto_reconnect: true,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &McpServerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_attempts: config.max_reconnect_attempts,
            auto_reconnect: config.auto_reconnect,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }
}

pub struct McpClient {
    name: String,
    connector: Arc<dyn McpConnector>,
    policy: ReconnectPolicy,
    session: RwLock<Option<Arc<McpSession>>>,
    supervisor: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    exhausted: AtomicBool,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("session", &self.current().map(|s| s.id().to_string()))
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

impl McpClient {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn McpConnector>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connector,
            policy,
            session: RwLock::new(None),
            supervisor: Mutex::new(None),
            exhausted: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &McpServerConfig) -> Result<Arc<Self>, AgentError> {
        config.validate()?;
        Ok(Self::new(
            config.name.clone(),
            Arc::new(ConfigConnector::new(config.clone())),
            ReconnectPolicy::from_config(config),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// 当前存活的会话
    pub fn current(&self) -> Option<Arc<McpSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|s| s.is_alive())
            .cloned()
    }

    /// 重连预算已用尽
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// 当前会话的代理工具；无存活会话时为空
    pub fn proxies(&self) -> Vec<Arc<dyn Tool>> {
        self.current()
            .map(|s| McpProxyTool::for_session(&s))
            .unwrap_or_default()
    }

    /// 建立会话（已有存活会话时直接返回）并确保监管任务在运行
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<McpSession>, AgentError> {
        if let Some(session) = self.current() {
            return Ok(session);
        }
        let session = self.open_session().await?;
        self.exhausted.store(false, Ordering::SeqCst);
        self.start_supervisor();
        Ok(session)
    }

    async fn open_session(&self) -> Result<Arc<McpSession>, AgentError> {
        let transport = self.connector.connect().await?;
        let session = McpSession::open(self.name.clone(), transport).await?;
        let previous = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&session));
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(session)
    }

    /// 取出已失效的会话（存活会话保持不动）
    fn take_dead_session(&self) -> Option<Arc<McpSession>> {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|s| !s.is_alive()).unwrap_or(false) {
            slot.take()
        } else {
            None
        }
    }

    fn start_supervisor(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((handle, _)) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(supervise(Arc::downgrade(self), token.clone()));
        *guard = Some((handle, token));
    }

    /// 带退避的重连；每次失败后等待 backoff 间隔，取消时立即返回
    async fn reconnect(&self, token: &CancellationToken) -> Result<Arc<McpSession>, AgentError> {
        let mut backoff = self.policy.backoff();
        let mut last_err = AgentError::TransportDisconnected(self.name.clone());
        for attempt in 1..=self.policy.max_attempts {
            match self.open_session().await {
                Ok(session) => {
                    tracing::info!(server = %self.name, attempt, session = %session.id(), "mcp reconnected");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(server = %self.name, attempt, error = %e, "mcp reconnect attempt failed");
                    last_err = e;
                }
            }
            if attempt < self.policy.max_attempts {
                let wait = backoff.next_backoff().unwrap_or(self.policy.max_backoff);
                tokio::select! {
                    _ = token.cancelled() => return Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        Err(last_err)
    }

    /// 停止监管任务并关闭会话；之后可再次 connect
    pub async fn close(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handle, token)) = supervisor {
            token.cancel();
            handle.abort();
        }
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

async fn supervise(client: Weak<McpClient>, token: CancellationToken) {
    loop {
        let poll = match client.upgrade() {
            Some(c) => c.policy.poll_interval,
            None => break,
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
        let Some(client) = client.upgrade() else {
            break;
        };
        if client.current().is_some() {
            continue;
        }
        if let Some(stale) = client.take_dead_session() {
            tracing::warn!(server = %client.name, session = %stale.id(), "mcp session lost");
            stale.close().await;
        }
        if !client.policy.auto_reconnect {
            break;
        }
        match client.reconnect(&token).await {
            Ok(_) => {}
            Err(AgentError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(
                    server = %client.name,
                    attempts = client.policy.max_attempts,
                    error = %e,
                    "mcp reconnect budget exhausted, server stays down"
                );
                client.exhausted.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}
