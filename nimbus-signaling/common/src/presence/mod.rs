//! 在线目录
//!
//! 全局共享、带 TTL 的 用户 → 节点 映射。每个用户一条记录，
//! 登录时写入、心跳续期、孤立断开时由所属节点删除。

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_im_core::error::Result;

pub use memory::InMemoryPresenceDirectory;
pub use redis::{RedisPresenceConfig, RedisPresenceDirectory};

use crate::models::{PresenceRecord, PresenceUpdate};

/// 默认键前缀
pub const DEFAULT_KEY_PREFIX: &str = "im:user:";
/// 默认日活键前缀
pub const DEFAULT_ACTIVE_USERS_PREFIX: &str = "IM-ACTIVE-USERS-";
/// 日活键保留天数
pub const ACTIVE_USERS_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// 读取记录（不存在返回 None），`expires_at` 由剩余 TTL 推导
    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>>;

    /// 读-改-写：合并设备分组条目，覆盖 brokerId / token，刷新 TTL
    async fn upsert(&self, update: &PresenceUpdate, ttl: Duration) -> Result<PresenceRecord>;

    /// 续期：仅当记录仍属于 `broker_id` 时生效，返回是否续期成功
    async fn renew_ttl(&self, user_id: &str, broker_id: &str, ttl: Duration) -> Result<bool>;

    /// 删除：仅当记录仍属于 `broker_id` 时生效，返回是否删除
    async fn delete_if_owned(&self, user_id: &str, broker_id: &str) -> Result<bool>;

    /// 记录日活（尽力而为）
    async fn record_active_user(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// TTL 换算为秒（至少 1 秒）
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_millis().div_ceil(1000).max(1) as u64
}
