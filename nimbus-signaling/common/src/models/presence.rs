//! 在线记录：用户 → 所在节点

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DeviceGroup;

/// 设备分组下的路由元数据
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

/// 在线记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    /// 所在节点标识
    pub broker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub drivers: BTreeMap<DeviceGroup, DriverInfo>,
    /// 由存储剩余 TTL 推导，不序列化
    #[serde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, broker_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            broker_id: broker_id.into(),
            token: None,
            drivers: BTreeMap::new(),
            expires_at: None,
        }
    }

    pub fn is_owned_by(&self, broker_id: &str) -> bool {
        self.broker_id == broker_id
    }

    /// 合并一次登录：覆盖 brokerId / token，合并设备分组条目
    pub fn apply(&mut self, update: &PresenceUpdate) {
        self.broker_id = update.broker_id.clone();
        self.token = update.token.clone();
        self.drivers.insert(update.device_group, update.driver.clone());
    }
}

/// 一次登录对在线记录的写入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub broker_id: String,
    pub token: Option<String>,
    pub device_group: DeviceGroup,
    pub driver: DriverInfo,
}

impl PresenceUpdate {
    pub fn into_record(self) -> PresenceRecord {
        let mut record = PresenceRecord::new(self.user_id.clone(), self.broker_id.clone());
        record.apply(&self);
        record
    }
}
