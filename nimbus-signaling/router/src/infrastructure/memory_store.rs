//! 内存消息存储，用于单机部署与测试

use std::collections::HashMap;

use async_trait::async_trait;
use nimbus_im_core::error::Result;
use tokio::sync::RwLock;

use crate::domain::model::StoredMessage;
use crate::domain::repository::MessageStore;

#[derive(Default)]
pub struct InMemoryMessageStore {
    groups: RwLock<HashMap<String, Vec<String>>>,
    messages: RwLock<Vec<StoredMessage>>,
    /// (owner, conversation) → 已读到的消息时间
    read_marks: RwLock<HashMap<(String, String), i64>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_group_members(&self, group_id: &str, members: Vec<String>) {
        self.groups.write().await.insert(group_id.to_string(), members);
    }

    pub async fn mark_read(&self, owner_id: &str, conversation_id: &str, up_to: i64) {
        self.read_marks
            .write()
            .await
            .insert((owner_id.to_string(), conversation_id.to_string()), up_to);
    }

    pub async fn stored(&self) -> Vec<StoredMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist(&self, message: &StoredMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        // 重复提交同一消息 ID 时保持幂等
        if let Some(id) = message.message_id() {
            if messages.iter().any(|m| m.message_id() == Some(id)) {
                return Ok(());
            }
        }
        messages.push(message.clone());
        Ok(())
    }

    async fn resolve_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        Ok(self
            .groups
            .read()
            .await
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn last_message(&self, owner_id: &str, conversation_id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.conversation_for(owner_id) == Some(conversation_id))
            .max_by_key(|m| m.message_time())
            .cloned())
    }

    async fn unread_count(&self, owner_id: &str, conversation_id: &str) -> Result<u64> {
        let read_up_to = self
            .read_marks
            .read()
            .await
            .get(&(owner_id.to_string(), conversation_id.to_string()))
            .copied()
            .unwrap_or(i64::MIN);
        let count = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| {
                m.conversation_for(owner_id) == Some(conversation_id)
                    && m.from_id() != owner_id
                    && m.message_time() > read_up_to
            })
            .count();
        Ok(count as u64)
    }
}
