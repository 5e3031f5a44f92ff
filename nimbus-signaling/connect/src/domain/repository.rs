//! 领域层依赖的外部协作方接口

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_im_core::error::Result;
use nimbus_signaling_common::{Envelope, MessageType};
use thiserror::Error;

use crate::domain::model::ConnectionIdentity;

/// 令牌校验通过后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 鉴权失败原因，对应发给客户端的拒绝码
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("token missing")]
    Missing,
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
}

impl AuthFailure {
    pub fn reply_kind(self) -> MessageType {
        match self {
            AuthFailure::Missing => MessageType::NotLoggedIn,
            AuthFailure::Expired => MessageType::TokenExpired,
            AuthFailure::Malformed => MessageType::TokenMalformed,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AuthFailure::Missing => "missing",
            AuthFailure::Expired => "expired",
            AuthFailure::Malformed => "malformed",
        }
    }
}

/// 身份校验
pub trait IdentityValidator: Send + Sync {
    /// 校验签名与有效期
    fn validate(&self, token: &str) -> std::result::Result<VerifiedToken, AuthFailure>;

    /// 剩余有效期，无法解析时返回 None
    fn remaining_validity(&self, token: &str) -> Option<Duration>;
}

/// 上行业务消息转发
#[async_trait]
pub trait UpstreamForwarder: Send + Sync {
    async fn forward(&self, identity: &ConnectionIdentity, envelope: Envelope) -> Result<()>;
}

/// 向其他接入节点发送控制指令
#[async_trait]
pub trait NodeNotifier: Send + Sync {
    /// 让 `broker_id` 节点上该用户指定设备类型的会话下线
    async fn force_logout(&self, broker_id: &str, user_id: &str, device_type: &str) -> Result<()>;
}
