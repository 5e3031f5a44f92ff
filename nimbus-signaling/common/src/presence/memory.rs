use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_im_core::error::Result;
use nimbus_im_core::utils::utc_day_key;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DEFAULT_ACTIVE_USERS_PREFIX, PresenceDirectory, ttl_secs};
use crate::models::{PresenceRecord, PresenceUpdate};

struct Entry {
    record: PresenceRecord,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    active_users: HashMap<String, HashSet<String>>,
}

/// 内存在线目录
///
/// 使用 tokio 时钟计算过期，测试中可配合 `tokio::time::pause` 推进时间。
#[derive(Default)]
pub struct InMemoryPresenceDirectory {
    state: Mutex<State>,
}

impl InMemoryPresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 剩余 TTL（记录不存在或已过期返回 None）
    pub async fn remaining_ttl(&self, user_id: &str) -> Option<Duration> {
        let mut state = self.state.lock().await;
        Self::live_entry(&mut state, user_id).map(|e| e.deadline - Instant::now())
    }

    /// 指定日期的日活数
    pub async fn active_user_count(&self, at: DateTime<Utc>) -> usize {
        let key = utc_day_key(DEFAULT_ACTIVE_USERS_PREFIX, at);
        let state = self.state.lock().await;
        state.active_users.get(&key).map(|s| s.len()).unwrap_or(0)
    }

    fn live_entry<'a>(state: &'a mut State, user_id: &str) -> Option<&'a mut Entry> {
        let expired = state
            .entries
            .get(user_id)
            .map(|e| e.deadline <= Instant::now())
            .unwrap_or(false);
        if expired {
            state.entries.remove(user_id);
        }
        state.entries.get_mut(user_id)
    }

    fn deadline(ttl: Duration) -> Instant {
        Instant::now() + Duration::from_secs(ttl_secs(ttl))
    }

    fn with_expiry(entry: &Entry) -> PresenceRecord {
        let mut record = entry.record.clone();
        let remaining = entry.deadline.saturating_duration_since(Instant::now());
        record.expires_at = chrono::Duration::from_std(remaining)
            .ok()
            .map(|d| Utc::now() + d);
        record
    }
}

#[async_trait]
impl PresenceDirectory for InMemoryPresenceDirectory {
    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        let mut state = self.state.lock().await;
        Ok(Self::live_entry(&mut state, user_id).map(|e| Self::with_expiry(e)))
    }

    async fn upsert(&self, update: &PresenceUpdate, ttl: Duration) -> Result<PresenceRecord> {
        let mut state = self.state.lock().await;
        let record = match Self::live_entry(&mut state, &update.user_id) {
            Some(entry) => {
                let mut record = entry.record.clone();
                record.apply(update);
                record
            }
            None => update.clone().into_record(),
        };
        let entry = Entry {
            record,
            deadline: Self::deadline(ttl),
        };
        let stored = Self::with_expiry(&entry);
        state.entries.insert(update.user_id.clone(), entry);
        Ok(stored)
    }

    async fn renew_ttl(&self, user_id: &str, broker_id: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        match Self::live_entry(&mut state, user_id) {
            Some(entry) if entry.record.is_owned_by(broker_id) => {
                entry.deadline = Self::deadline(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owned(&self, user_id: &str, broker_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let owned = Self::live_entry(&mut state, user_id)
            .map(|e| e.record.is_owned_by(broker_id))
            .unwrap_or(false);
        if owned {
            state.entries.remove(user_id);
        }
        Ok(owned)
    }

    async fn record_active_user(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let key = utc_day_key(DEFAULT_ACTIVE_USERS_PREFIX, at);
        let mut state = self.state.lock().await;
        state
            .active_users
            .entry(key)
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceGroup, DriverInfo};

    const TTL: Duration = Duration::from_secs(35);

    fn login(user: &str, broker: &str, group: DeviceGroup) -> PresenceUpdate {
        PresenceUpdate {
            user_id: user.into(),
            broker_id: broker.into(),
            token: Some("t".into()),
            device_group: group,
            driver: DriverInfo::default(),
        }
    }

    #[tokio::test]
    async fn newer_owner_survives_stale_cleanup() {
        let dir = InMemoryPresenceDirectory::new();
        dir.upsert(&login("u1", "node-a", DeviceGroup::Web), TTL).await.unwrap();
        dir.upsert(&login("u1", "node-b", DeviceGroup::Web), TTL).await.unwrap();

        assert!(!dir.delete_if_owned("u1", "node-a").await.unwrap());
        let record = dir.get("u1").await.unwrap().unwrap();
        assert_eq!(record.broker_id, "node-b");

        assert!(dir.delete_if_owned("u1", "node-b").await.unwrap());
        assert!(dir.get("u1").await.unwrap().is_none());
        assert!(!dir.delete_if_owned("u1", "node-b").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_and_owner_renewal_extends() {
        let dir = InMemoryPresenceDirectory::new();
        dir.upsert(&login("u1", "node-a", DeviceGroup::Mobile), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let before = dir.remaining_ttl("u1").await.unwrap();
        assert!(dir.renew_ttl("u1", "node-a", TTL).await.unwrap());
        let after = dir.remaining_ttl("u1").await.unwrap();
        assert!(after > before);
        assert_eq!(after, TTL);

        assert!(!dir.renew_ttl("u1", "node-b", TTL).await.unwrap());
        assert_eq!(dir.remaining_ttl("u1").await.unwrap(), TTL);

        tokio::time::advance(TTL).await;
        assert!(dir.get("u1").await.unwrap().is_none());
        assert!(!dir.renew_ttl("u1", "node-a", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn active_users_are_counted_once_per_day() {
        let dir = InMemoryPresenceDirectory::new();
        let now = Utc::now();
        dir.record_active_user("u1", now).await.unwrap();
        dir.record_active_user("u1", now).await.unwrap();
        dir.record_active_user("u2", now).await.unwrap();
        assert_eq!(dir.active_user_count(now).await, 2);
    }
}
