//! Agent 消息日志：只追加、有序、有上限
//!
//! 每个 Agent 独占一份 Memory；超过 max_messages 时按 FIFO 淘汰最旧的消息。
//! 消息一旦追加即不可变，对外只暴露只读迭代与快照。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致，额外的 Tool 角色承载工具结果）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 工具调用引用：把 tool 消息关联到发起它的调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 由 Memory 在追加时分配的单调序号（被淘汰后也不会复用）
    #[serde(default)]
    pub seq: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRef>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role,
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 工具结果消息
    pub fn tool(call: ToolCallRef, content: impl Into<String>) -> Self {
        Self {
            tool_call: Some(call),
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// 若为工具结果消息，返回工具名
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_call.as_ref().map(|c| c.name.as_str())
    }
}

/// 有界 FIFO 消息日志
#[derive(Clone, Debug)]
pub struct Memory {
    messages: VecDeque<Message>,
    max_messages: usize,
    next_seq: u64,
    evicted: u64,
}

impl Memory {
    pub fn new(max_messages: usize) -> Self {
        let max_messages = max_messages.max(1);
        Self {
            messages: VecDeque::with_capacity(max_messages.min(256)),
            max_messages,
            next_seq: 0,
            evicted: 0,
        }
    }

    /// 追加消息并分配序号；超出上限时淘汰最旧的消息。返回分配的序号。
    pub fn push(&mut self, mut msg: Message) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        msg.seq = seq;
        self.messages.push_back(msg);
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
            self.evicted += 1;
        }
        seq
    }

    pub fn extend(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + ExactSizeIterator {
        self.messages.iter()
    }

    /// 审计用快照
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    /// 最近 n 条（按时间正序）
    pub fn recent(&self, n: usize) -> Vec<&Message> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.next_seq = 0;
        self.evicted = 0;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// 累计被淘汰的消息数
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_assigns_increasing_seq() {
        let mut mem = Memory::new(10);
        assert_eq!(mem.push(Message::user("a")), 0);
        assert_eq!(mem.push(Message::assistant("b")), 1);
        let seqs: Vec<u64> = mem.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_fifo_eviction_keeps_newest() {
        let mut mem = Memory::new(3);
        for i in 0..5 {
            mem.push(Message::user(format!("m{i}")));
        }
        assert_eq!(mem.len(), 3);
        assert_eq!(mem.evicted(), 2);
        let contents: Vec<&str> = mem.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_never_exceeds_bound() {
        let mut mem = Memory::new(4);
        for i in 0..100 {
            mem.push(Message::user(i.to_string()));
            assert!(mem.len() <= 4);
        }
    }

    #[test]
    fn test_zero_bound_is_clamped() {
        let mut mem = Memory::new(0);
        mem.push(Message::user("x"));
        mem.push(Message::user("y"));
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.last().unwrap().content, "y");
    }

    #[test]
    fn test_tool_message_carries_reference() {
        let msg = Message::tool(
            ToolCallRef {
                id: "call_1".to_string(),
                name: "echo".to_string(),
            },
            "hi",
        );
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_name(), Some("echo"));
    }

    #[test]
    fn test_recent() {
        let mut mem = Memory::new(10);
        mem.extend(["a", "b", "c"].into_iter().map(Message::user));
        let recent: Vec<&str> = mem.recent(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(recent, vec!["b", "c"]);
        assert_eq!(mem.recent(10).len(), 3);
    }
}
