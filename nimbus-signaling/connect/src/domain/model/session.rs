use std::sync::Arc;

use chrono::{DateTime, Utc};
use nimbus_signaling_common::{DeviceGroup, Envelope};

use super::connection::{ConnectionHandle, SendError};

/// 一个设备的一条在线连接
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub device_type: Option<String>,
    pub device_group: DeviceGroup,
    pub handle: Arc<ConnectionHandle>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        device_type: Option<String>,
        device_group: DeviceGroup,
        handle: Arc<ConnectionHandle>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_type,
            device_group,
            handle,
            created_at: Utc::now(),
        }
    }

    /// 会话 id 即底层连接 id
    pub fn session_id(&self) -> &str {
        self.handle.id()
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.handle.send(envelope)
    }

    pub fn is_same_connection(&self, handle: &ConnectionHandle) -> bool {
        self.handle.id() == handle.id()
    }
}
