//! 领域层依赖的外部协作方接口

use async_trait::async_trait;
use nimbus_im_core::error::Result;

use crate::domain::model::StoredMessage;

/// 消息存储
///
/// 路由层只用它决定扇出目标并在投递前落库，不关心消息内容
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist(&self, message: &StoredMessage) -> Result<()>;

    /// 群成员（含发送者）
    async fn resolve_group_members(&self, group_id: &str) -> Result<Vec<String>>;

    /// `owner_id` 视角下某个会话的最后一条消息
    async fn last_message(&self, owner_id: &str, conversation_id: &str) -> Result<Option<StoredMessage>>;

    /// `owner_id` 在某个会话中的未读数
    async fn unread_count(&self, owner_id: &str, conversation_id: &str) -> Result<u64>;
}
