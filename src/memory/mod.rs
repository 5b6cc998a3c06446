//! 记忆层：Agent 独占的有界消息日志与轨迹持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{Memory, Message, Role, ToolCallRef};
pub use persistence::TracePersistence;
