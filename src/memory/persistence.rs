//! 轨迹持久化
//!
//! 将 Memory 快照或 Flow 审计轨迹写入 / 从 JSON 文件加载，便于离线诊断失败的 run。

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

use crate::memory::Message;

/// 单文件 JSON 持久化
#[derive(Debug)]
pub struct TracePersistence {
    path: PathBuf,
}

impl TracePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载消息轨迹；文件不存在时返回空 Vec
    pub fn load(&self) -> anyhow::Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        self.load_json()
    }

    pub fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
        self.save_json(&messages)
    }

    /// 写入任意可序列化值（如 Flow 审计轨迹）；父目录不存在时自动创建
    pub fn save_json<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(value)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("write trace {}", self.path.display()))?;
        Ok(())
    }

    pub fn load_json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read trace {}", self.path.display()))?;
        Ok(serde_json::from_str(&data)?)
    }
}
