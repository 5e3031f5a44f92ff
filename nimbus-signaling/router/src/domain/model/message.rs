//! 业务消息：由业务服务提交，经路由投递到在线用户

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 系统发起的操作使用的发送者
pub const SYSTEM_SENDER: &str = "system";

/// 单聊消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessage {
    /// 为空时由投递服务生成
    #[serde(default)]
    pub message_id: Option<String>,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub message_time: i64,
    #[serde(default)]
    pub body: Value,
}

/// 群聊消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    pub from_id: String,
    pub group_id: String,
    #[serde(default)]
    pub message_time: i64,
    #[serde(default)]
    pub body: Value,
}

/// 群组操作（入群、退群、改名等），不落库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupOperation {
    #[serde(default)]
    pub message_id: Option<String>,
    /// 为空时视为系统操作
    #[serde(default)]
    pub from_id: Option<String>,
    pub group_id: String,
    #[serde(default)]
    pub body: Value,
}

/// 针对已发送消息的操作（撤回、编辑）
///
/// `to_id` 与 `group_id` 二选一，决定通知单个用户还是全体群成员
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAction {
    pub message_id: String,
    pub from_id: String,
    #[serde(default)]
    pub to_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub action_time: i64,
    #[serde(default)]
    pub body: Value,
}

/// 音视频信令，只投递给在线的接收者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSignal {
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub body: Value,
}

/// 持久化单元
#[derive(Debug, Clone, PartialEq)]
pub enum StoredMessage {
    Private(PrivateMessage),
    Group {
        message: GroupMessage,
        /// 落库时的成员快照，用于未读计数
        members: Vec<String>,
    },
}

impl StoredMessage {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            StoredMessage::Private(m) => m.message_id.as_deref(),
            StoredMessage::Group { message, .. } => message.message_id.as_deref(),
        }
    }

    pub fn from_id(&self) -> &str {
        match self {
            StoredMessage::Private(m) => &m.from_id,
            StoredMessage::Group { message, .. } => &message.from_id,
        }
    }

    pub fn message_time(&self) -> i64 {
        match self {
            StoredMessage::Private(m) => m.message_time,
            StoredMessage::Group { message, .. } => message.message_time,
        }
    }

    /// 站在 `owner_id` 角度的会话标识：单聊为对方，群聊为群
    pub fn conversation_for(&self, owner_id: &str) -> Option<&str> {
        match self {
            StoredMessage::Private(m) if m.from_id == owner_id => Some(&m.to_id),
            StoredMessage::Private(m) if m.to_id == owner_id => Some(&m.from_id),
            StoredMessage::Private(_) => None,
            StoredMessage::Group { message, members } => members
                .iter()
                .any(|m| m == owner_id)
                .then_some(message.group_id.as_str()),
        }
    }
}
